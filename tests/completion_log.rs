/*!
The per-script completion record has to show up exactly once per
request, whatever order the exit status and the end of stdout arrive
in, and also when the script never produces a usable response. Counting
log records needs a process-wide logger, so this lives in its own test
binary.
*/

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use hyper::{Body, Method, Request, StatusCode};
use log::{LevelFilter, Log, Metadata, Record};

use scriptgate::{
    conf::Cfg,
    gate::{ConnInfo, Gate},
    mime::MimeMap,
};

struct CompletionCounter {
    lines: Mutex<Vec<String>>,
}

impl CompletionCounter {
    fn count(&self) -> usize {
        self.lines.lock().unwrap().len()
    }
}

impl Log for CompletionCounter {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = format!("{}", record.args());
        if line.contains("script exited with") {
            self.lines.lock().unwrap().push(line);
        }
    }

    fn flush(&self) {}
}

static COUNTER: CompletionCounter = CompletionCounter {
    lines: Mutex::new(Vec::new()),
};

fn fixture_root(tag: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "scriptgate-completion-{}-{}",
        tag,
        std::process::id()
    ));
    if p.exists() {
        std::fs::remove_dir_all(&p).unwrap();
    }
    std::fs::create_dir_all(p.join("cgi-bin")).unwrap();
    p.canonicalize().unwrap()
}

fn write_script(p: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(p, contents).unwrap();
    let mut perms = std::fs::metadata(p).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(p, perms).unwrap();
}

fn test_cfg(root: &Path) -> Cfg {
    Cfg {
        addr: "127.0.0.1".parse().unwrap(),
        http_port: 0,
        user: None,
        run_as_uid: None,
        web_root: root.to_path_buf(),
        script_root: root.join("cgi-bin"),
        cgi_prefix: "/cgi-bin".to_string(),
        follow_symlinks: false,
        log_level: LevelFilter::Info,
        server_admin: String::new(),
        server_name: String::new(),
        mime_types: MimeMap::default(),
        rewrites: vec![],
        redirects: vec![],
        https: None,
    }
}

fn conn() -> ConnInfo {
    ConnInfo {
        remote: "127.0.0.1:40000".parse().unwrap(),
        local: "127.0.0.1:80".parse().unwrap(),
    }
}

fn request(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("host", "test.example")
        .body(Body::empty())
        .unwrap()
}

async fn settle_at(expected: usize) {
    for _ in 0..100 {
        if COUNTER.count() >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Enough slack for a duplicate record to surface if one were coming.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(COUNTER.count(), expected);
}

#[tokio::test]
async fn completion_record_appears_exactly_once_per_script() {
    log::set_logger(&COUNTER).unwrap();
    log::set_max_level(LevelFilter::Info);

    let root = fixture_root("once");
    write_script(
        &root.join("cgi-bin/ok"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\ndone'\n",
    );
    write_script(&root.join("cgi-bin/dud"), "#!/bin/sh\nexit 3\n");
    let gate = Gate::new(test_cfg(&root));

    // Normal run: the record lands after both the exit status and the
    // end of stdout have been observed.
    let resp = gate.handle(request("/cgi-bin/ok"), conn(), false).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"done");
    settle_at(1).await;

    // A script that exits without ever writing a header boundary still
    // ran; its record goes out before the 500 does.
    let resp = gate.handle(request("/cgi-bin/dud"), conn(), false).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    settle_at(2).await;
}
