//! The broker client: a background worker thread holding the TCP
//! connection to the MQTT broker, an outbound holdback queue, and the
//! self-pipe/`poll()` multiplexing that lets it wait on "socket
//! readable" and "new outbound work" at once.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read, write as nix_write};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::codec::{self, ParseOutcome};
use crate::error::{Error, ErrorKind, Result};

const PING_GUARD: Duration = Duration::from_millis(100);

struct OutboundPublish {
    send_at: Instant,
    topic: Vec<u8>,
    payload: Vec<u8>,
}

struct Outbound {
    queue: VecDeque<OutboundPublish>,
}

/// Callback invoked with each parsed inbound PUBLISH's topic/payload.
pub type PublishCallback = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Owns the worker thread's lifetime; `publish`/`cancel` hand work to
/// the outbound queue and wake the worker via the self-pipe.
pub struct BrokerClient {
    outbound: Arc<Mutex<Outbound>>,
    running: Arc<AtomicBool>,
    wake_write_fd: OwnedFd,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Connect to `host:port`, send CONNECT/SUBSCRIBE, and spawn the
    /// worker thread. `on_publish` is invoked from the worker thread
    /// whenever an inbound PUBLISH is parsed.
    pub fn create(
        host: &str,
        port: u16,
        keepalive: Duration,
        on_publish: PublishCallback,
    ) -> Result<Self> {
        let mut socket = TcpStream::connect((host, port))
            .map_err(|e| Error::new(ErrorKind::IoProtocol, format!("connect failed: {e}")))?;

        let keepalive_secs = keepalive.as_secs().min(u16::MAX as u64) as u16;
        socket
            .write_all(&codec::encode_connect(keepalive_secs))
            .map_err(|e| Error::new(ErrorKind::IoProtocol, format!("CONNECT failed: {e}")))?;
        socket
            .write_all(&codec::encode_subscribe())
            .map_err(|e| Error::new(ErrorKind::IoProtocol, format!("SUBSCRIBE failed: {e}")))?;

        let (wake_read_fd, wake_write_fd) =
            pipe().map_err(|e| Error::new(ErrorKind::IoProtocol, format!("pipe failed: {e}")))?;

        let running = Arc::new(AtomicBool::new(true));
        let outbound = Arc::new(Mutex::new(Outbound {
            queue: VecDeque::new(),
        }));

        let worker_running = running.clone();
        let worker_outbound = outbound.clone();
        let worker = std::thread::spawn(move || {
            run_worker(
                socket,
                wake_read_fd,
                worker_running,
                worker_outbound,
                keepalive,
                on_publish,
            );
        });

        Ok(BrokerClient {
            outbound,
            running,
            wake_write_fd,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn wake_worker(&self) {
        let _ = nix_write(&self.wake_write_fd, &[0u8]);
    }

    /// Queue an immediate publish for `topic`/`payload`.
    pub fn publish(&self, topic: &[u8], payload: &[u8]) -> Result<()> {
        self.publish_at(topic, payload, Duration::ZERO)
    }

    /// Like `publish`, but sent only after `holdback` has elapsed.
    /// FIFO order is preserved across calls.
    pub fn publish_at(&self, topic: &[u8], payload: &[u8], holdback: Duration) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::NotRunning, "broker worker has exited"));
        }
        self.outbound.lock().queue.push_back(OutboundPublish {
            send_at: Instant::now() + holdback,
            topic: topic.to_vec(),
            payload: payload.to_vec(),
        });
        self.wake_worker();
        Ok(())
    }

    /// Remove any still-pending (not yet sent) publishes for `topic`.
    pub fn cancel(&self, topic: &[u8]) {
        self.outbound.lock().queue.retain(|p| p.topic != topic);
    }

    pub fn destroy(&self) {
        self.running.store(false, Ordering::Release);
        self.wake_worker();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_worker(
    mut socket: TcpStream,
    wake_read_fd: OwnedFd,
    running: Arc<AtomicBool>,
    outbound: Arc<Mutex<Outbound>>,
    keepalive: Duration,
    on_publish: PublishCallback,
) {
    let mut inbound = Buffer::new();
    let mut cursor = 0usize;
    let mut last_ping = Instant::now();
    const READ_CHUNK: usize = 4096;

    while running.load(Ordering::Acquire) {
        let next_ping_deadline = last_ping + keepalive.saturating_sub(PING_GUARD);
        let timeout = next_ping_deadline.saturating_duration_since(Instant::now());
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;

        let mut fds = [
            PollFd::new(socket.as_fd(), PollFlags::POLLIN),
            PollFd::new(wake_read_fd.as_fd(), PollFlags::POLLIN),
        ];
        let poll_result = poll(&mut fds, PollTimeout::from(timeout_ms));

        match poll_result {
            Ok(0) => {}
            Ok(_) => {
                let socket_ready = fds[0]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN));
                let wake_ready = fds[1]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN));
                if wake_ready {
                    drain_wake_pipe(&wake_read_fd);
                }
                if socket_ready {
                    let base = inbound.reserve(READ_CHUNK);
                    match socket.read(&mut inbound.spare_mut()[..READ_CHUNK]) {
                        Ok(0) => {
                            warn!("broker closed the connection");
                            running.store(false, Ordering::Release);
                            break;
                        }
                        Ok(n) => {
                            inbound.set_len(base, n);
                            process_inbound(&mut inbound, &mut cursor, &on_publish);
                        }
                        Err(e) => {
                            error!("broker socket read failed: {e}");
                            running.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("poll failed: {e}");
                running.store(false, Ordering::Release);
                break;
            }
        }

        if let Err(e) = drain_due_outbound(&mut socket, &outbound) {
            error!("broker socket write failed: {e}");
            running.store(false, Ordering::Release);
            break;
        }

        if Instant::now() >= next_ping_deadline {
            if let Err(e) = socket.write_all(&codec::encode_ping()) {
                error!("PING write failed: {e}");
                running.store(false, Ordering::Release);
                break;
            }
            last_ping = Instant::now();
        }
    }

    let _ = socket.write_all(&codec::encode_disconnect());
    debug!("broker worker exiting");
}

fn process_inbound(buf: &mut Buffer, cursor: &mut usize, on_publish: &PublishCallback) {
    loop {
        let remaining = &buf.as_slice()[*cursor..];
        match codec::parse_message(remaining) {
            ParseOutcome::Success {
                topic,
                payload,
                consumed,
            } => {
                on_publish(topic, payload);
                *cursor += consumed;
            }
            ParseOutcome::Skipped { consumed } => {
                *cursor += consumed;
            }
            ParseOutcome::ReadMore => break,
            ParseOutcome::Error(e) => {
                warn!("dropping malformed frame: {e}");
                buf.clear();
                *cursor = 0;
                break;
            }
        }
    }
    if *cursor > 0 {
        buf.consume(*cursor);
        *cursor = 0;
    }
}

/// Pop and send every queued publish whose holdback has elapsed, in
/// FIFO order, stopping (and leaving the rest queued) at the first
/// entry that isn't due yet.
fn drain_due_outbound(socket: &mut TcpStream, outbound: &Mutex<Outbound>) -> std::io::Result<()> {
    let now = Instant::now();
    loop {
        let next = {
            let mut guard = outbound.lock();
            match guard.queue.front() {
                Some(p) if p.send_at <= now => guard.queue.pop_front(),
                _ => None,
            }
        };
        let Some(publish) = next else {
            return Ok(());
        };
        let frame = codec::encode_publish(&publish.topic, &publish.payload)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        socket.write_all(&frame)?;
    }
}

fn drain_wake_pipe(fd: &OwnedFd) {
    let mut scratch = [0u8; 64];
    loop {
        match read(fd, &mut scratch) {
            Ok(0) => break,
            Ok(n) if n < scratch.len() => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CONNECT, SUBSCRIBE};

    #[test]
    fn process_inbound_consumes_whole_frame() {
        let mut buf = Buffer::new();
        let frame = codec::encode_publish(b"a/b", b"payload").unwrap();
        buf.assign(&frame);
        let mut cursor = 0;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: PublishCallback = Arc::new(move |t: &[u8], p: &[u8]| {
            seen2.lock().push((t.to_vec(), p.to_vec()));
        });
        process_inbound(&mut buf, &mut cursor, &cb);
        assert!(buf.is_empty());
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].0, b"a/b");
    }

    #[test]
    fn process_inbound_leaves_partial_frame_buffered() {
        let mut buf = Buffer::new();
        let frame = codec::encode_publish(b"a/b", b"payload").unwrap();
        buf.assign(&frame[..frame.len() - 1]);
        let mut cursor = 0;
        let cb: PublishCallback = Arc::new(|_t: &[u8], _p: &[u8]| {});
        process_inbound(&mut buf, &mut cursor, &cb);
        assert_eq!(buf.len(), frame.len() - 1);
    }

    /// Drives a real `BrokerClient` against a loopback `TcpListener`
    /// standing in for the broker: checks that the CONNECT/SUBSCRIBE
    /// handshake is sent, that a held-back publish doesn't arrive
    /// before its delay elapses, and that `cancel` stops it arriving
    /// at all.
    #[test]
    fn publish_respects_holdback_and_cancel_drops_it() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut scratch = [0u8; 256];
            let connect_n = conn.read(&mut scratch).unwrap();
            assert_eq!(scratch[0], CONNECT);
            let _ = connect_n;
            let sub_n = conn.read(&mut scratch).unwrap();
            assert_eq!(scratch[0], SUBSCRIBE);
            let _ = sub_n;
            conn
        });

        let client = BrokerClient::create(
            "127.0.0.1",
            addr.port(),
            Duration::from_secs(60),
            Arc::new(|_: &[u8], _: &[u8]| {}),
        )
        .unwrap();
        let mut conn = peer.join().unwrap();

        client.publish_at(b"held", b"back", Duration::from_millis(150)).unwrap();
        conn.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut scratch = [0u8; 256];
        assert!(matches!(
            conn.read(&mut scratch),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
        ));

        client.cancel(b"held");
        std::thread::sleep(Duration::from_millis(250));
        conn.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        assert!(matches!(
            conn.read(&mut scratch),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
        ));

        client.destroy();
    }

    #[test]
    fn cancel_removes_pending_entries_for_topic() {
        let outbound = Outbound {
            queue: VecDeque::from(vec![
                OutboundPublish {
                    send_at: Instant::now(),
                    topic: b"a".to_vec(),
                    payload: vec![],
                },
                OutboundPublish {
                    send_at: Instant::now(),
                    topic: b"b".to_vec(),
                    payload: vec![],
                },
            ]),
        };
        let mutex = Mutex::new(outbound);
        mutex.lock().queue.retain(|p| p.topic != b"a");
        assert_eq!(mutex.lock().queue.len(), 1);
        assert_eq!(mutex.lock().queue[0].topic, b"b");
    }
}
