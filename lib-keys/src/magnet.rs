//! Magnet URIs
//!
//! Carries exact-topic keys between clients. Parameter names with a
//! `.suffix` (such as `tr.1`, `tr.2`) merge under the base name.

use crate::keys::{KeyBytes, KeyError};
use std::collections::BTreeMap;
use url::Url;

const BYTESTAG_URN_PREFIX: &str = "urn:bstagih:";
const BITTORRENT_URN_PREFIX: &str = "urn:btih:";

/// A parsed magnet URI
#[derive(Debug, Clone, Default)]
pub struct MagnetUri {
    params: BTreeMap<String, Vec<String>>,
}

impl MagnetUri {
    pub fn new() -> Self {
        MagnetUri::default()
    }

    /// Parse a magnet URI string
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let url = Url::parse(s).map_err(|e| KeyError::NotMagnet(e.to_string()))?;

        if url.scheme() != "magnet" {
            return Err(KeyError::NotMagnet(format!(
                "scheme is not magnet: {}",
                url.scheme()
            )));
        }

        let mut uri = MagnetUri::new();

        for (name, value) in url.query_pairs() {
            let base_name = match name.split_once('.') {
                Some((base, _suffix)) => base.to_string(),
                None => name.to_string(),
            };

            uri.params
                .entry(base_name)
                .or_default()
                .push(value.to_string());
        }

        Ok(uri)
    }

    /// All values recorded for a parameter name
    pub fn params(&self, name: &str) -> &[String] {
        self.params.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The first value recorded for a parameter name
    pub fn first_param(&self, name: &str) -> Option<&str> {
        self.params(name).first().map(String::as_str)
    }

    /// The `xt` exact topic, if present
    pub fn exact_topic(&self) -> Option<&str> {
        self.first_param("xt")
    }

    /// The key carried by a `urn:bstagih:` exact topic
    pub fn bytestag_info_hash(&self) -> Option<KeyBytes> {
        let topic = self.exact_topic()?;
        let encoded = topic.strip_prefix(BYTESTAG_URN_PREFIX)?;

        KeyBytes::parse_silent(encoded)
    }

    /// The key carried by a `urn:btih:` exact topic.
    ///
    /// Parsed for completeness; carries no behavior in this node.
    pub fn bittorrent_info_hash(&self) -> Option<KeyBytes> {
        let topic = self.exact_topic()?;
        let encoded = topic.strip_prefix(BITTORRENT_URN_PREFIX)?;

        KeyBytes::parse_silent(encoded)
    }

    /// Replace the exact topic with a bytestag hash in base32 form
    pub fn set_bytestag_info_hash(&mut self, key: &KeyBytes) {
        let topic = format!("{}{}", BYTESTAG_URN_PREFIX, key.base32());
        self.params.insert("xt".to_string(), vec![topic]);
    }

    /// Render the URI back to a string
    pub fn to_uri_string(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());

        for (name, values) in &self.params {
            for value in values {
                query.append_pair(name, value);
            }
        }

        format!("magnet:?{}", query.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytestag_topic() {
        let uri =
            MagnetUri::parse("magnet:?xt=urn:bstagih:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ").unwrap();

        assert_eq!(
            uri.exact_topic(),
            Some("urn:bstagih:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ")
        );
        assert_eq!(
            uri.bytestag_info_hash(),
            KeyBytes::parse_silent("3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ")
        );
        assert_eq!(uri.bytestag_info_hash().unwrap().as_bytes().len(), 20);
    }

    #[test]
    fn test_parse_bittorrent_topic() {
        let uri =
            MagnetUri::parse("magnet:?xt=urn:btih:da39a3ee5e6b4b0d3255bfef95601890afd80709")
                .unwrap();

        assert_eq!(uri.bittorrent_info_hash(), Some(KeyBytes::new_hash(b"")));
        assert_eq!(uri.bytestag_info_hash(), None);
    }

    #[test]
    fn test_dotted_params_merge() {
        let uri = MagnetUri::parse("magnet:?tr.1=udp%3A%2F%2Fa&tr.2=udp%3A%2F%2Fb").unwrap();

        assert_eq!(uri.params("tr"), ["udp://a", "udp://b"]);
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(MagnetUri::parse("http://example.com/?xt=1").is_err());
        assert!(MagnetUri::parse("garbage").is_err());
    }

    #[test]
    fn test_set_info_hash() {
        let key = KeyBytes::new_hash(b"shared file");
        let mut uri = MagnetUri::new();
        uri.set_bytestag_info_hash(&key);

        let rendered = uri.to_uri_string();
        let parsed = MagnetUri::parse(&rendered).unwrap();

        assert_eq!(parsed.bytestag_info_hash(), Some(key));
    }
}
