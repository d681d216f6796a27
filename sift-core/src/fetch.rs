use crate::cache::Cache;
use crate::control::Control;
use crate::error::{Error, Result};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_TTL: Duration = Duration::from_secs(600);

/// Cached HTTP fetcher for script library sources.
pub struct LibraryFetcher {
    client: reqwest::blocking::Client,
    cache: Cache<String>,
}

impl LibraryFetcher {
    pub fn new(cache_capacity: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            cache: Cache::new(cache_capacity),
        })
    }

    /// Resolve a library reference: a URL fetches directly, anything else
    /// looks up the location's named-library map first.
    pub fn resolve(&self, control: &Control, library: &str) -> Result<String> {
        if library.starts_with("http://") || library.starts_with("https://") {
            return self.fetch(library);
        }
        match control.libraries.get(library) {
            Some(url) => self.fetch(url),
            None => Err(Error::NotFound(format!("library '{library}'"))),
        }
    }

    fn fetch(&self, url: &str) -> Result<String> {
        self.cache.get_with(url, CACHE_TTL, || {
            let response = self
                .client
                .get(url)
                .send()
                .map_err(|e| Error::Http(e.to_string()))?;
            if !response.status().is_success() {
                return Err(Error::Http(format!("{} fetching {url}", response.status())));
            }
            response.text().map_err(|e| Error::Http(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_named_library_is_not_found() {
        let fetcher = LibraryFetcher::new(8).expect("fetcher");
        let err = fetcher
            .resolve(&Control::default(), "no-such-lib")
            .expect_err("unknown name");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn named_library_resolves_through_the_control_map() {
        let mut control = Control::default();
        control
            .libraries
            .insert("util".into(), "http://127.0.0.1:1/unreachable".into());
        let fetcher = LibraryFetcher::new(8).expect("fetcher");
        // The mapping resolves; the fetch itself fails fast against a
        // closed port.
        let err = fetcher.resolve(&control, "util").expect_err("unreachable");
        assert!(matches!(err, Error::Http(_)));
    }
}
