use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use actix_files::Files;
use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer};
use anyhow::{Context, anyhow};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves a repository over HTTP on a loopback port so the browser loads it
/// the way a learner's dev server would.
///
/// The server runs on its own actix system thread and stops when dropped.
pub struct StaticServer {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl StaticServer {
    pub fn start(root: &Path) -> anyhow::Result<Self> {
        let root: PathBuf = root
            .canonicalize()
            .with_context(|| format!("repository directory {} is missing", root.display()))?;
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::spawn(move || {
            actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new().service(
                        Files::new("/", root.clone())
                            .index_file("index.html")
                            .use_etag(false)
                            .use_last_modified(false),
                    )
                })
                .workers(1)
                .disable_signals()
                .bind(("127.0.0.1", 0))?;

                let addr = server.addrs().first().copied();
                let server = server.run();
                let _ = ready_tx.send(addr.map(|addr| (addr, server.handle())));
                server.await
            })
        });

        let (addr, handle) = match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Some(ready)) => ready,
            Ok(None) => return Err(anyhow!("static server bound no address")),
            Err(RecvTimeoutError::Disconnected) => {
                // The thread ended early, most likely because the bind failed
                let reason = match thread.join() {
                    Ok(Err(e)) => e.to_string(),
                    _ => "the server thread exited".to_string(),
                };
                return Err(anyhow!("static server did not start: {reason}"));
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(anyhow!("static server did not start within {STARTUP_TIMEOUT:?}"));
            }
        };

        Ok(Self {
            addr,
            handle,
            thread: Some(thread),
        })
    }

    /// URL of a file below the served root, e.g. `public/index.html`.
    pub fn url(&self, relative: &Path) -> String {
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("http://{}/{path}", self.addr)
    }
}

impl Drop for StaticServer {
    fn drop(&mut self) {
        // `stop` sends the command right away; its future only reports completion
        drop(self.handle.stop(false));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
