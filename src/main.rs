use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use offload::cgi;
use offload::config::{Config, LoggingConfig, Mode};
use offload::front;
use offload::pipeline::App;

const LISTEN_BACKLOG: u32 = 16;

fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("offloadd: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);

    let mode = config.mode();
    if mode == Mode::Daemon && config.listen.daemonize {
        if let Err(e) = daemonize() {
            eprintln!("offloadd: failed to daemonize: {e}");
            return ExitCode::from(1);
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match mode {
        Mode::Cgi => runtime.block_on(run_cgi(config)),
        Mode::Daemon => runtime.block_on(run_daemon(config)),
    }
}

fn load_config() -> Result<Config, offload::error::OffloadError> {
    if let Ok(path) = std::env::var("OFFLOAD_CONFIG") {
        return Config::load(path);
    }
    let default_path = "offload.toml";
    if std::path::Path::new(default_path).exists() {
        Config::load(default_path)
    } else {
        Ok(Config::default())
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_cgi(config: Config) -> ExitCode {
    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cgi::run(&app).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("CGI request failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(config: Config) -> ExitCode {
    info!("Starting {}", offload::SERVER_STRING);

    let addr = config.server_addr();
    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match bind_listener(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind socket");
            return ExitCode::from(2);
        }
    };
    info!("Listening on {addr}");

    let router = front::router(Arc::clone(&app));
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    // let in-flight fetchers land their entries before the process goes
    app.fetches.wait_idle().await;

    let snapshot = app.stats.snapshot();
    info!(
        hits = snapshot.hits,
        misses = snapshot.misses,
        fetches = snapshot.fetches_started,
        bytes = snapshot.bytes_streamed,
        "Server shutdown complete"
    );
    ExitCode::SUCCESS
}

/// Walk the resolved addresses for the configured endpoint, taking the
/// first that binds.
async fn bind_listener(addr: &str) -> std::io::Result<tokio::net::TcpListener> {
    let mut last_err = None;
    for candidate in tokio::net::lookup_host(addr).await? {
        let socket = if candidate.is_ipv4() {
            tokio::net::TcpSocket::new_v4()
        } else {
            tokio::net::TcpSocket::new_v6()
        }?;
        socket.set_reuseaddr(true)?;
        let bound = socket
            .bind(candidate)
            .and_then(|()| socket.listen(LISTEN_BACKLOG));
        match bound {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no usable address")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

/// Classic double-detach: fork, let the parent exit, start a new
/// session, and point stdio at /dev/null.
fn daemonize() -> std::io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::chdir(c"/".as_ptr()) == -1 {
            return Err(std::io::Error::last_os_error());
        }

        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull != -1 {
            libc::dup2(devnull, 0);
            libc::dup2(devnull, 1);
            libc::dup2(devnull, 2);
            if devnull > 2 {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}
