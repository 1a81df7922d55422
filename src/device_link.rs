//! Serial link to one arm controller.
//!
//! The port is split into a read half and a write half, each owned by its own
//! worker thread:
//!
//! - the writer drains an unbounded queue of outbound frames, so
//!   [`CommandSink::send_async`] never blocks the caller;
//! - the read loop splits the byte stream into lines, decodes each as a frame
//!   and dispatches on its type code (1051 telemetry updates the pose store).
//!
//! Neither worker reconnects. An I/O failure ends the worker and is reported
//! as [`Notification::ConnectionLost`]; reconnecting is up to the operator.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use log::{debug, error, info, warn};

use crate::errors::{Result, RoarmError};
use crate::frame::{discard_overflow, extract_lines, Frame, Inbound, MAX_PENDING_BYTES};
use crate::notifications::{Notification, Notifier};
use crate::pose::PoseStore;

/// Anything outbound frames can be handed to.
///
/// The execution engine, the jog loop and the robot controller only talk to
/// this trait, so they can be driven without hardware.
pub trait CommandSink: Send + Sync {
    /// Queue `frame` for transmission and return immediately.
    fn send_async(&self, frame: &Frame) -> Result<()>;

    /// Release the underlying transport. Idempotent.
    fn close(&self) {}
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub port: String,
    pub baud: u32,
    pub read_timeout: Duration,
    /// The controller resets when the port opens; nothing is sent before this elapses.
    pub settle: Duration,
    /// Upper bound on waiting for each worker in [`DeviceLink::close`].
    pub close_timeout: Duration,
}

impl LinkSettings {
    pub fn new(port: &str, baud: u32) -> Self {
        Self {
            port: port.to_string(),
            baud,
            read_timeout: Duration::from_millis(100),
            settle: Duration::from_secs(2),
            close_timeout: Duration::from_secs(2),
        }
    }
}

pub struct DeviceLink {
    robot: String,
    outbound: Mutex<Option<Sender<Frame>>>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl DeviceLink {
    /// Open the serial port, wait for the controller to come up, then start
    /// the read and write workers.
    pub fn connect(robot: &str, settings: &LinkSettings, pose: PoseStore, notifier: Notifier) -> Result<Self> {
        info!(target: "device_link", "[{}] Opening {} at {} baud", robot, settings.port, settings.baud);
        let port = serialport::new(settings.port.as_str(), settings.baud)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| RoarmError::Connection(format!("{}: {}", settings.port, e)))?;
        let write_half = port
            .try_clone()
            .map_err(|e| RoarmError::Connection(format!("{}: cannot clone port: {}", settings.port, e)))?;
        thread::sleep(settings.settle);
        let link = Self::spawn(robot, port, write_half, pose, notifier, settings.close_timeout);
        info!(target: "device_link", "[{}] Connected on {}", robot, settings.port);
        Ok(link)
    }

    /// Start the workers over arbitrary read/write halves.
    pub fn spawn<R, W>(
        robot: &str,
        reader: R,
        writer: W,
        pose: PoseStore,
        notifier: Notifier,
        close_timeout: Duration,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded::<Frame>();

        let writer_handle = {
            let robot = robot.to_string();
            let connected = Arc::clone(&connected);
            let notifier = notifier.clone();
            thread::spawn(move || {
                let mut writer = writer;
                for frame in rx.iter() {
                    let line = frame.encode();
                    debug!(target: "device_link", "[{}] -> {}", robot, line.trim_end());
                    let result = writer.write_all(line.as_bytes()).and_then(|_| writer.flush());
                    if let Err(e) = result {
                        error!(target: "device_link", "[{}] Write failed: {}", robot, e);
                        connected.store(false, Ordering::Relaxed);
                        notifier.send(Notification::ConnectionLost {
                            robot: robot.clone(),
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
                debug!(target: "device_link", "[{}] Writer stopped", robot);
            })
        };

        let reader_handle = {
            let robot = robot.to_string();
            let stop = Arc::clone(&stop);
            let connected = Arc::clone(&connected);
            thread::spawn(move || {
                receive_loop(&robot, reader, &stop, &connected, &pose, &notifier);
            })
        };

        Self {
            robot: robot.to_string(),
            outbound: Mutex::new(Some(tx)),
            stop,
            connected,
            reader: Mutex::new(Some(reader_handle)),
            writer: Mutex::new(Some(writer_handle)),
            close_timeout,
        }
    }

    pub fn robot(&self) -> &str {
        &self.robot
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Ask the controller for its pose; the answer arrives as 1051 telemetry.
    pub fn request_pose(&self) -> Result<()> {
        self.send_async(&Frame::request_pose())
    }

    pub fn notify_saved_mission(&self, name: &str) -> Result<()> {
        self.send_async(&Frame::mission_saved(name))
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the sender ends the writer's receive loop.
        let sender = self.outbound.lock().unwrap_or_else(|p| p.into_inner()).take();
        if sender.is_none() && !self.has_workers() {
            return;
        }
        drop(sender);
        let writer = self.writer.lock().unwrap_or_else(|p| p.into_inner()).take();
        let reader = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take();
        join_bounded("device_link", &self.robot, "writer", writer, self.close_timeout);
        join_bounded("device_link", &self.robot, "read loop", reader, self.close_timeout);
        self.connected.store(false, Ordering::Relaxed);
        info!(target: "device_link", "[{}] Link closed", self.robot);
    }

    fn has_workers(&self) -> bool {
        self.reader.lock().map(|g| g.is_some()).unwrap_or(false)
            || self.writer.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

impl CommandSink for DeviceLink {
    fn send_async(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(RoarmError::Connection(format!("{} is not connected", self.robot)));
        }
        let guard = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        let tx = guard
            .as_ref()
            .ok_or_else(|| RoarmError::Connection(format!("{} link is closed", self.robot)))?;
        tx.send(frame.clone())
            .map_err(|_| RoarmError::Connection(format!("{} writer has stopped", self.robot)))
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait for `handle` up to `timeout`. A worker that does not finish in time is
/// left running and logged.
pub(crate) fn join_bounded(target: &str, robot: &str, what: &str, handle: Option<JoinHandle<()>>, timeout: Duration) {
    let Some(handle) = handle else { return };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(target: target, "[{}] {} did not stop within {:?}, leaking it", robot, what, timeout);
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        error!(target: target, "[{}] {} panicked", robot, what);
    }
}

fn receive_loop<R: Read>(
    robot: &str,
    mut reader: R,
    stop: &AtomicBool,
    connected: &AtomicBool,
    pose: &PoseStore,
    notifier: &Notifier,
) {
    info!(target: "device_link", "[{}] Read loop started", robot);
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                error!(target: "device_link", "[{}] Read failed: {}", robot, e);
                connected.store(false, Ordering::Relaxed);
                notifier.send(Notification::ConnectionLost {
                    robot: robot.to_string(),
                    reason: e.to_string(),
                });
                break;
            }
        }
        for line in extract_lines(&mut buffer) {
            if line.trim().is_empty() {
                continue;
            }
            handle_line(robot, &line, pose, notifier);
        }
        if let Err(e) = discard_overflow(&mut buffer, MAX_PENDING_BYTES) {
            warn!(target: "device_link", "[{}] {}", robot, e);
        }
    }
    info!(target: "device_link", "[{}] Read loop stopped", robot);
}

fn handle_line(robot: &str, line: &str, pose: &PoseStore, notifier: &Notifier) {
    let frame = match Frame::decode(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "device_link", "[{}] Dropping frame: {}", robot, e);
            return;
        }
    };
    match Inbound::from_frame(frame) {
        Inbound::PoseTelemetry { x, y, z, t } => {
            let updated = pose.update(|p| {
                if let Some(x) = x {
                    p.x = x;
                }
                if let Some(y) = y {
                    p.y = y;
                }
                if let Some(z) = z {
                    p.z = z;
                }
                if let Some(t) = t {
                    p.t = t;
                }
            });
            debug!(target: "device_link", "[{}] Telemetry: {}", robot, updated);
            notifier.send(Notification::PoseChanged {
                robot: robot.to_string(),
                pose: updated,
            });
        }
        Inbound::Ack => {
            debug!(target: "device_link", "[{}] Pose request acknowledged", robot);
        }
        Inbound::Unrecognized(frame) => {
            info!(target: "device_link", "[{}] Unrecognized frame T={}", robot, frame.code());
        }
    }
}

/// Sink that records frames instead of sending them. Used for dry runs.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl CommandSink for RecordingSink {
    fn send_async(&self, frame: &Frame) -> Result<()> {
        debug!(target: "device_link", "dry run -> {}", frame.encode().trim_end());
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications;
    use crate::pose::Pose;
    use std::io;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::BrokenPipe, "unplugged"))
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn telemetry_updates_pose_and_bad_lines_are_dropped() {
        let input = b"garbage\n{\"T\":105}\n{\"T\":1051,\"x\":10.5,\"t\":1.0}\n{\"T\":999}\n".to_vec();
        let pose = PoseStore::new(Pose::new(1.0, 2.0, 3.0, 4.0));
        let (notifier, rx) = notifications::channel(16);
        let link = DeviceLink::spawn(
            "arm",
            io::Cursor::new(input),
            io::sink(),
            pose.clone(),
            notifier,
            Duration::from_secs(1),
        );
        assert!(wait_for(|| pose.read().x == 10.5));
        assert_eq!(pose.read(), Pose::new(10.5, 2.0, 3.0, 1.0));
        link.close();
        link.close();
        assert!(!link.is_connected());
        let notes = rx.drain();
        assert!(notes.iter().any(|n| matches!(n, Notification::PoseChanged { .. })));
        assert!(!notes.iter().any(|n| matches!(n, Notification::ConnectionLost { .. })));
    }

    #[test]
    fn endless_noise_does_not_stall_telemetry() {
        let mut input = vec![b'~'; 3 * MAX_PENDING_BYTES];
        input.extend_from_slice(b"\n{\"T\":1051,\"y\":-7.0}\n");
        let pose = PoseStore::new(Pose::new(1.0, 2.0, 3.0, 4.0));
        let (notifier, _rx) = notifications::channel(16);
        let link = DeviceLink::spawn(
            "arm",
            io::Cursor::new(input),
            io::sink(),
            pose.clone(),
            notifier,
            Duration::from_secs(1),
        );
        assert!(wait_for(|| pose.read().y == -7.0));
        assert!(link.is_connected());
        link.close();
    }

    #[test]
    fn frames_are_written_one_per_line() {
        let out = SharedBuf::default();
        let (notifier, _rx) = notifications::channel(16);
        let link = DeviceLink::spawn(
            "arm",
            io::empty(),
            out.clone(),
            PoseStore::default(),
            notifier,
            Duration::from_secs(1),
        );
        link.request_pose().unwrap();
        link.notify_saved_mission("pick").unwrap();
        link.close();
        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(Frame::decode(lines[0]).unwrap(), Frame::request_pose());
        assert_eq!(Frame::decode(lines[1]).unwrap(), Frame::mission_saved("pick"));
        assert!(matches!(link.request_pose(), Err(RoarmError::Connection(_))));
    }

    #[test]
    fn read_failure_reports_connection_lost() {
        let (notifier, rx) = notifications::channel(16);
        let link = DeviceLink::spawn(
            "arm",
            FailingReader,
            io::sink(),
            PoseStore::default(),
            notifier,
            Duration::from_secs(1),
        );
        assert!(wait_for(|| !link.is_connected()));
        assert!(matches!(
            link.send_async(&Frame::request_pose()),
            Err(RoarmError::Connection(_))
        ));
        link.close();
        let notes = rx.drain();
        assert!(notes
            .iter()
            .any(|n| matches!(n, Notification::ConnectionLost { robot, .. } if robot == "arm")));
    }
}
