use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use objwire_frame::{FrameConfig, FramedTransport};
use objwire_transport::{Endpoint, IpcStream, Listener, TransportError};
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, InvokeHandler};
use crate::error::Result;

/// Banner line opening the library-mode announcement.
pub const LIBRARY_BANNER: &str = "OBJWIRE";

/// How a server hands out connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeMode {
    /// One connection at a time, each served to completion.
    #[default]
    Simple,
    /// One thread per connection.
    Threaded,
    /// Announce the endpoint on stdout, serve exactly one connection.
    Library,
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServeMode::Simple => "simple",
            ServeMode::Threaded => "threaded",
            ServeMode::Library => "library",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid server mode: {0}")]
pub struct ParseServeModeError(String);

impl FromStr for ServeMode {
    type Err = ParseServeModeError;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "simple" => Ok(ServeMode::Simple),
            "threaded" => Ok(ServeMode::Threaded),
            "lib" | "library" => Ok(ServeMode::Library),
            _ => Err(ParseServeModeError(input.to_string())),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: ServeMode,
    pub endpoint: Endpoint,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServeMode::default(),
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            frame: FrameConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_mode(mut self, mode: ServeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

/// Stops a server's accept loop from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    endpoint: Endpoint,
}

impl ShutdownHandle {
    /// Stop accepting. A throwaway connection wakes a blocked accept.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "server shutdown requested");
            let _ = self.endpoint.connect(Some(std::time::Duration::from_millis(200)));
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Accepts connections and serves each with its own [`Dispatcher`].
///
/// Every connection gets a fresh object table; the handler is shared.
pub struct Server {
    listener: Listener,
    handler: Arc<dyn InvokeHandler>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    next_connection: AtomicU64,
}

impl Server {
    /// Bind the configured endpoint.
    pub fn bind(config: ServerConfig, handler: Arc<dyn InvokeHandler>) -> Result<Self> {
        let listener = config.endpoint.bind()?;
        info!(endpoint = %listener.local_endpoint(), mode = %config.mode, "server listening");
        Ok(Self {
            listener,
            handler,
            config,
            running: Arc::new(AtomicBool::new(true)),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Endpoint clients should connect to. Carries the real port when bound
    /// to port 0.
    pub fn local_endpoint(&self) -> Endpoint {
        self.listener.local_endpoint()
    }

    pub fn mode(&self) -> ServeMode {
        self.config.mode
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            endpoint: self.local_endpoint(),
        }
    }

    /// Serve according to the configured mode. Library mode announces on
    /// stdout.
    pub fn serve(self) -> Result<()> {
        match self.config.mode {
            ServeMode::Simple => self.serve_simple(),
            ServeMode::Threaded => self.serve_threaded(),
            ServeMode::Library => self.serve_library(&mut std::io::stdout()),
        }
    }

    fn accept(&self) -> Result<Option<(u64, IpcStream)>> {
        let stream = self.listener.accept()?;
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        Ok(Some((connection, stream)))
    }

    /// Serve connections one after another until shut down.
    pub fn serve_simple(&self) -> Result<()> {
        while let Some((connection, stream)) = self.accept()? {
            // A broken session must not take the server down.
            let _ = serve_stream(
                stream,
                Arc::clone(&self.handler),
                self.config.frame.clone(),
                connection,
            );
        }
        info!("server stopped");
        Ok(())
    }

    /// Serve each connection on its own thread until shut down.
    pub fn serve_threaded(&self) -> Result<()> {
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        while let Some((connection, stream)) = self.accept()? {
            sessions.retain(|session| !session.is_finished());

            let handler = Arc::clone(&self.handler);
            let frame = self.config.frame.clone();
            let session = thread::Builder::new()
                .name(format!("objwire-conn-{connection}"))
                .spawn(move || {
                    let _ = serve_stream(stream, handler, frame, connection);
                })
                .map_err(TransportError::Io)?;
            sessions.push(session);
        }

        sessions.retain(|session| !session.is_finished());
        info!(active = sessions.len(), "server stopped");
        Ok(())
    }

    /// Write the library-mode announcement: banner, then host and port
    /// (or the socket path), one per line.
    pub fn announce(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "{LIBRARY_BANNER}")?;
        match self.local_endpoint() {
            Endpoint::Tcp { host, port } => {
                writeln!(out, "{host}")?;
                writeln!(out, "{port}")?;
            }
            Endpoint::Unix(path) => writeln!(out, "{}", path.display())?,
        }
        out.flush()
    }

    /// Announce on `out`, accept exactly one connection, stop listening and
    /// serve it to completion.
    pub fn serve_library(self, out: &mut impl Write) -> Result<()> {
        self.announce(out).map_err(TransportError::Io)?;

        let Server {
            listener,
            handler,
            config,
            next_connection,
            ..
        } = self;
        let stream = listener.accept()?;
        drop(listener);

        serve_stream(
            stream,
            handler,
            config.frame,
            next_connection.into_inner(),
        )
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.local_endpoint())
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

/// Serve one accepted connection until the peer quits or disconnects.
pub fn serve_stream(
    stream: IpcStream,
    handler: Arc<dyn InvokeHandler>,
    frame: FrameConfig,
    connection: u64,
) -> Result<()> {
    info!(connection, peer = %stream.peer_description(), "session started");
    let transport = FramedTransport::from_stream(stream, frame)?;
    let dispatcher = Dispatcher::new(handler);

    let result = dispatcher.serve(&transport);
    if let Err(err) = transport.close() {
        debug!(connection, error = %err, "close after session failed");
    }

    match &result {
        Ok(()) => info!(
            connection,
            exposed = dispatcher.objects().len(),
            "session ended"
        ),
        Err(err) => warn!(connection, error = %err, "session failed"),
    }
    result
}
