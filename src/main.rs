use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Request, Server,
};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use tower::ServiceBuilder;

use scriptgate::{
    conf::Cfg,
    gate::{ConnInfo, Gate},
    rlog::AccessLogLayer,
    tls, SERVER,
};

async fn wrapped_main() -> Result<(), String> {
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let mut cfg = Cfg::from_file(&cfg_path)?;

    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("scriptgate")
        .build();
    TermLogger::init(
        cfg.log_level,
        log_cfg,
        TerminalMode::Stdout,
        ColorChoice::Auto,
    )
    .map_err(|e| format!("error initializing logger: {}", &e))?;

    log::info!("{} starting", &*SERVER);

    let https_cfg = cfg.https.take();
    let user = cfg.user.clone();
    let addr = cfg.addr;
    let http_addr = SocketAddr::from((addr, cfg.http_port));
    let gate = Arc::new(Gate::new(cfg));

    let http_gate = gate.clone();
    let make_http = make_service_fn(move |sock: &AddrStream| {
        let gate = http_gate.clone();
        let conn = ConnInfo {
            remote: sock.remote_addr(),
            local: sock.local_addr(),
        };
        async move {
            let svc = service_fn(move |req: Request<Body>| {
                let gate = gate.clone();
                async move { Ok::<_, Infallible>(gate.handle(req, conn, false).await) }
            });
            Ok::<_, Infallible>(
                ServiceBuilder::new()
                    .layer(AccessLogLayer::new(conn.remote))
                    .service(svc),
            )
        }
    });

    let http_server = Server::try_bind(&http_addr)
        .map_err(|e| format!("error binding {}: {}", &http_addr, &e))?
        .serve(make_http);
    log::info!("listening for HTTP on {}", &http_addr);

    let https_server = match https_cfg {
        Some(h) => {
            let https_addr = SocketAddr::from((addr, h.port));
            match tls::make_listener(&h.cert_pem, &h.key_pem, &https_addr) {
                Ok(listener) => {
                    let https_gate = gate.clone();
                    let make_https = make_service_fn(
                        move |sock: &tokio_rustls::server::TlsStream<AddrStream>| {
                            let gate = https_gate.clone();
                            let (tcp, _) = sock.get_ref();
                            let conn = ConnInfo {
                                remote: tcp.remote_addr(),
                                local: tcp.local_addr(),
                            };
                            async move {
                                let svc = service_fn(move |req: Request<Body>| {
                                    let gate = gate.clone();
                                    async move {
                                        Ok::<_, Infallible>(gate.handle(req, conn, true).await)
                                    }
                                });
                                Ok::<_, Infallible>(
                                    ServiceBuilder::new()
                                        .layer(AccessLogLayer::new(conn.remote))
                                        .service(svc),
                                )
                            }
                        },
                    );
                    log::info!("listening for HTTPS on {}", &https_addr);
                    Some(Server::builder(listener).serve(make_https))
                }
                Err(e) => {
                    eprintln!("failed to create HTTPS server: {}", &e);
                    std::process::exit(2);
                }
            }
        }
        None => None,
    };

    if let Some(user) = user.as_deref() {
        drop_root::set_user_group(user, user)
            .map_err(|e| format!("error dropping privileges to {:?}: {}", user, &e))?;
        log::info!("running as {}", user);
    }

    match https_server {
        Some(https_server) => {
            tokio::try_join!(http_server, https_server)
                .map_err(|e| format!("server error: {}", &e))?;
        }
        None => {
            http_server
                .await
                .map_err(|e| format!("server error: {}", &e))?;
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = wrapped_main().await {
        eprintln!("{}", &e);
        std::process::exit(1);
    }
}
