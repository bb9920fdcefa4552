/*!
Extension-to-MIME-type mapping with a wildcard fallback entry.
*/

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    str::FromStr,
};

pub const OCTET_STREAM: &str = "application/octet-stream";

static DEFAULT: &[(&str, &str)] = &[
    ("css", "text/css"),
    ("gz", "application/gzip"),
    ("gif", "image/gif"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("ico", "image/vnd.microsoft.icon"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("png", "image/png"),
    ("pdf", "application/pdf"),
    ("svg", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("txt", "text/plain"),
    ("wasm", "application/wasm"),
    ("webp", "image/webp"),
    ("xml", "application/xml"),
    ("zip", "application/zip"),
];

#[derive(Debug)]
pub struct MimeMap {
    map: BTreeMap<OsString, String>,
}

impl MimeMap {
    pub fn empty() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub fn set<K, V>(&mut self, k: K, v: V)
    where
        K: Into<OsString>,
        V: Into<String>,
    {
        let k = k.into();
        let v = v.into();
        _ = self.map.insert(k, v);
    }

    /// Type for a file extension: the configured entry, else the `"*"`
    /// wildcard entry, else `application/octet-stream`.
    pub fn mime_type<'a, K: AsRef<OsStr>>(&'a self, ext: Option<K>) -> &'a str {
        if let Some(ext) = ext {
            let k = ext.as_ref().to_os_string().to_ascii_lowercase();
            if let Some(t) = self.map.get(&k) {
                return t.as_str();
            }
        }
        match self.map.get(OsStr::new("*")) {
            Some(t) => t.as_str(),
            None => OCTET_STREAM,
        }
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        let map: BTreeMap<OsString, String> = DEFAULT
            .iter()
            .map(|(k, v)| (OsString::from_str(k).unwrap(), String::from(*v)))
            .collect();

        Self { map }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_extension() {
        let m = MimeMap::default();
        assert_eq!(m.mime_type(Some("html")), "text/html");
        assert_eq!(m.mime_type(Some("HTML")), "text/html");
    }

    #[test]
    fn octet_stream_when_nothing_matches() {
        let m = MimeMap::default();
        assert_eq!(m.mime_type(Some("qqq")), OCTET_STREAM);
        assert_eq!(m.mime_type(None::<&str>), OCTET_STREAM);
    }

    #[test]
    fn wildcard_beats_octet_stream() {
        let mut m = MimeMap::default();
        m.set("*", "text/plain");
        assert_eq!(m.mime_type(Some("qqq")), "text/plain");
        assert_eq!(m.mime_type(None::<&str>), "text/plain");
        // A concrete entry still wins over the wildcard.
        assert_eq!(m.mime_type(Some("png")), "image/png");
    }
}
