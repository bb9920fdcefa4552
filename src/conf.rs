/*!
Configuration loading and validation.
*/

use std::{
    collections::BTreeMap,
    ffi::CString,
    net::IpAddr,
    path::{Path, PathBuf},
};

use log::LevelFilter;
use serde::Deserialize;

use crate::{
    mime::MimeMap,
    rewrite::{RedirectRule, RewriteRule},
};

const DEFAULT_CGI_PREFIX: &str = "/cgi-bin";

#[derive(Debug, Deserialize)]
struct HttpsFile {
    port: Option<u16>,
    certificate: Option<String>,
    certificate_file: Option<PathBuf>,
    certificate_key: Option<String>,
    certificate_key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CfgFile {
    ip_address: Option<IpAddr>,
    http_port: Option<u16>,
    user: Option<String>,
    web_root: PathBuf,
    cgi_root: Option<PathBuf>,
    cgi_prefix: Option<String>,
    follow_symlinks: Option<bool>,
    log_level: Option<String>,
    server_admin: Option<String>,
    server_name: Option<String>,
    https: Option<HttpsFile>,
    mime_types: Option<BTreeMap<String, String>>,
    rewrite: Option<Vec<RewriteRule>>,
    redirect: Option<Vec<RedirectRule>>,
}

/// PEM material for the HTTPS listener, already read in. Building the
/// listener itself happens at startup so a bad certificate is fatal
/// there, not here.
#[derive(Debug)]
pub struct HttpsCfg {
    pub port: u16,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug)]
pub struct Cfg {
    pub addr: IpAddr,
    pub http_port: u16,
    pub user: Option<String>,
    /// Uid of the configured run-as user; scripts fall back to their
    /// file owner when this is unset.
    pub run_as_uid: Option<u32>,
    pub web_root: PathBuf,
    pub script_root: PathBuf,
    pub cgi_prefix: String,
    pub follow_symlinks: bool,
    pub log_level: LevelFilter,
    pub server_admin: String,
    pub server_name: String,
    pub mime_types: MimeMap,
    pub rewrites: Vec<RewriteRule>,
    pub redirects: Vec<RedirectRule>,
    pub https: Option<HttpsCfg>,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    match s.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        _ => Err(format!("unrecognized log_level {:?}", s)),
    }
}

/// Looks a user name up in the password database. Called once at
/// startup, before any other thread exists.
fn lookup_uid(name: &str) -> Result<u32, String> {
    let cname =
        CString::new(name).map_err(|_| format!("user name {:?} contains a NUL byte", name))?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        Err(format!("no such user: {:?}", name))
    } else {
        Ok(unsafe { (*pw).pw_uid })
    }
}

fn read_pem(
    what: &str,
    inline: Option<String>,
    file: Option<PathBuf>,
) -> Result<Vec<u8>, String> {
    match (inline, file) {
        (Some(pem), None) => Ok(pem.into_bytes()),
        (None, Some(p)) => std::fs::read(&p)
            .map_err(|e| format!("error reading {} file {}: {}", what, p.display(), &e)),
        _ => Err(format!(
            "[https] requires exactly one of {} or {}_file",
            what, what
        )),
    }
}

impl Cfg {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Cfg, String> {
        let p = p.as_ref();
        log::trace!("Cfg::from_file( {} ) called.", p.display());

        let cfg_bytes = std::fs::read(p)
            .map_err(|e| format!("error reading config file {}: {}", p.display(), &e))?;
        let cf: CfgFile = toml::from_slice(&cfg_bytes)
            .map_err(|e| format!("error parsing config file {}: {}", p.display(), &e))?;

        let web_root = cf.web_root.canonicalize().map_err(|e| {
            format!("cannot canonicalize web_root {:?}: {}", &cf.web_root, &e)
        })?;

        let script_root = {
            let raw = match cf.cgi_root {
                Some(sub) => web_root.join(sub),
                None => web_root.clone(),
            };
            raw.canonicalize()
                .map_err(|e| format!("cannot canonicalize cgi_root {:?}: {}", &raw, &e))?
        };

        let cgi_prefix = match cf.cgi_prefix {
            Some(s) => {
                if !s.starts_with('/') {
                    return Err(format!("cgi_prefix {:?} must begin with '/'", &s));
                }
                s
            }
            None => DEFAULT_CGI_PREFIX.to_string(),
        };

        let log_level = match cf.log_level {
            Some(s) => parse_level(&s)?,
            None => LevelFilter::Info,
        };

        let run_as_uid = match cf.user.as_deref() {
            Some(name) => Some(lookup_uid(name)?),
            None => None,
        };

        let mut mime_types = MimeMap::default();
        if let Some(table) = cf.mime_types {
            for (ext, mtype) in table {
                mime_types.set(ext, mtype);
            }
        }

        let https = match cf.https {
            Some(h) => {
                let port = h.port.unwrap_or(443);
                let cert_pem = read_pem("certificate", h.certificate, h.certificate_file)?;
                let key_pem =
                    read_pem("certificate_key", h.certificate_key, h.certificate_key_file)?;
                Some(HttpsCfg {
                    port,
                    cert_pem,
                    key_pem,
                })
            }
            None => None,
        };

        Ok(Cfg {
            addr: cf.ip_address.unwrap_or_else(|| "0.0.0.0".parse().unwrap()),
            http_port: cf.http_port.unwrap_or(80),
            user: cf.user,
            run_as_uid,
            web_root,
            script_root,
            cgi_prefix,
            follow_symlinks: cf.follow_symlinks.unwrap_or(false),
            log_level,
            server_admin: cf.server_admin.unwrap_or_default(),
            server_name: cf.server_name.unwrap_or_default(),
            mime_types,
            rewrites: cf.rewrite.unwrap_or_default(),
            redirects: cf.redirect.unwrap_or_default(),
            https,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture_root(tag: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "scriptgate-conf-{}-{}",
            tag,
            std::process::id()
        ));
        if p.exists() {
            std::fs::remove_dir_all(&p).unwrap();
        }
        std::fs::create_dir_all(p.join("cgi-bin")).unwrap();
        p
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let root = fixture_root("minimal");
        let cfg_path = root.join("config.toml");
        std::fs::write(
            &cfg_path,
            format!("web_root = {:?}\ncgi_root = \"cgi-bin\"\n", root),
        )
        .unwrap();

        let cfg = Cfg::from_file(&cfg_path).unwrap();
        assert_eq!(cfg.http_port, 80);
        assert_eq!(cfg.cgi_prefix, "/cgi-bin");
        assert_eq!(cfg.log_level, LevelFilter::Info);
        assert!(!cfg.follow_symlinks);
        assert!(cfg.https.is_none());
        assert!(cfg.run_as_uid.is_none());
        assert_eq!(cfg.script_root, root.canonicalize().unwrap().join("cgi-bin"));
    }

    #[test]
    fn rules_and_mime_table_are_read() {
        let root = fixture_root("rules");
        let cfg_path = root.join("config.toml");
        std::fs::write(
            &cfg_path,
            format!(
                r#"
web_root = {:?}
log_level = "debug"

[mime_types]
weird = "application/x-weird"
"*" = "text/plain"

[[rewrite]]
prefix = "/old"
replacement = "/new"

[[redirect]]
prefix = "/gone"
location = "https://elsewhere.example/"
status = 301
"#,
                root
            ),
        )
        .unwrap();

        let cfg = Cfg::from_file(&cfg_path).unwrap();
        assert_eq!(cfg.log_level, LevelFilter::Debug);
        assert_eq!(cfg.mime_types.mime_type(Some("weird")), "application/x-weird");
        assert_eq!(cfg.mime_types.mime_type(Some("qqq")), "text/plain");
        assert_eq!(cfg.rewrites.len(), 1);
        assert_eq!(cfg.redirects.len(), 1);
        assert_eq!(cfg.redirects[0].status, Some(301));
    }

    #[test]
    fn https_requires_exactly_one_material_source() {
        let root = fixture_root("https");
        let cfg_path = root.join("config.toml");
        std::fs::write(
            &cfg_path,
            format!(
                "web_root = {:?}\n\n[https]\nport = 8443\n",
                root
            ),
        )
        .unwrap();

        let err = Cfg::from_file(&cfg_path).unwrap_err();
        assert!(err.contains("certificate"));
    }

    #[test]
    fn bad_log_level_is_an_error() {
        assert!(parse_level("loud").is_err());
        assert_eq!(parse_level("TRACE").unwrap(), LevelFilter::Trace);
    }
}
