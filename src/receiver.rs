use crate::flow::FlowMessage;
use crate::pipeline::FlowPipeline;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Maximum UDP payload the listener accepts; larger datagrams are truncated
/// by the socket layer.
const MAX_DATAGRAM: usize = 9216;

/// Poll interval at which idle workers re-check the shutdown flag.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Turns one received datagram into decoded flow records.
///
/// The wire-level flow protocol is not part of this crate; a concrete
/// decoder (NetFlow, IPFIX, ...) plugs in through this seam. An undecodable
/// payload yields no records — UDP ingestion is best-effort.
pub trait Decoder: Send + Sync {
    fn decode(&self, payload: &[u8], peer: SocketAddr) -> Vec<FlowMessage>;
}

/// Decodes one JSON-encoded [`FlowMessage`] per datagram. Used by the tests
/// and for loopback feeding; real deployments plug in a wire decoder.
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, payload: &[u8], peer: SocketAddr) -> Vec<FlowMessage> {
        match serde_json::from_slice::<FlowMessage>(payload) {
            Ok(msg) => vec![msg],
            Err(err) => {
                debug!(peer = %peer, error = %err, "discarding undecodable datagram");
                Vec::new()
            }
        }
    }
}

/// UDP flow listener with a small pool of synchronous worker threads.
///
/// Each worker reads one datagram, decodes it and invokes the pipeline on
/// the calling thread; there is no queueing between decode and process.
pub struct UdpReceiver {
    socket: UdpSocket,
    workers: usize,
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl UdpReceiver {
    /// Binds the listener socket. A bind failure is fatal to startup.
    pub fn bind(addr: &str, workers: usize) -> crate::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Self {
            socket,
            workers,
            handles: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the worker pool. Must not be called before the pipeline
    /// finished startup.
    pub fn start(
        &mut self,
        decoder: Arc<dyn Decoder>,
        pipeline: Arc<FlowPipeline>,
    ) -> crate::Result<()> {
        info!(workers = self.workers, "starting flow workers");
        for n in 0..self.workers {
            let socket = self.socket.try_clone()?;
            let decoder = decoder.clone();
            let pipeline = pipeline.clone();
            let shutdown = self.shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("flow-worker-{n}"))
                .spawn(move || {
                    let mut buf = [0u8; MAX_DATAGRAM];
                    while !shutdown.load(Ordering::Relaxed) {
                        match socket.recv_from(&mut buf) {
                            Ok((len, peer)) => {
                                for msg in decoder.decode(&buf[..len], peer) {
                                    pipeline.consume(&msg);
                                }
                            }
                            Err(err)
                                if matches!(
                                    err.kind(),
                                    ErrorKind::WouldBlock | ErrorKind::TimedOut
                                ) => {}
                            Err(err) => {
                                error!(error = %err, "flow socket read failed");
                                break;
                            }
                        }
                    }
                })?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Signals the workers to stop and joins them.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
