//! Shared access signature tokens

use url::Url;

use crate::backend::{BackendError, BackendResult};

/// Pre-signed query parameters appended to every request
pub struct SasCredential {
    pairs: Vec<(String, String)>,
}

impl SasCredential {
    /// Parse a SAS token, with or without the leading `?`
    pub fn parse(token: &str) -> BackendResult<Self> {
        let token = token.trim().trim_start_matches('?');
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(token.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if !pairs.iter().any(|(k, v)| k == "sig" && !v.is_empty()) {
            return Err(BackendError::configuration(
                "sas_token is not a shared access signature (missing sig parameter)",
            ));
        }
        Ok(Self { pairs })
    }

    /// Append the signature parameters to a request URL
    pub fn apply(&self, url: &mut Url) {
        url.query_pairs_mut()
            .extend_pairs(self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_apply() {
        let sas = SasCredential::parse("?sv=2021-08-06&ss=b&sig=abc%2Bdef%3D").unwrap();
        let mut url =
            Url::parse("https://tfaccount.blob.core.windows.net/tfstate/state?comp=lease").unwrap();
        sas.apply(&mut url);

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("comp".to_string(), "lease".to_string()));
        assert!(pairs.contains(&("sig".to_string(), "abc+def=".to_string())));
        assert!(pairs.contains(&("sv".to_string(), "2021-08-06".to_string())));
    }

    #[test]
    fn test_parse_without_question_mark() {
        assert!(SasCredential::parse("sv=2021-08-06&sig=abc").is_ok());
    }

    #[test]
    fn test_parse_requires_signature() {
        assert!(matches!(
            SasCredential::parse("sv=2021-08-06&ss=b"),
            Err(BackendError::Configuration(_))
        ));
        assert!(SasCredential::parse("sig=").is_err());
    }
}
