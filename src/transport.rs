//! Transport layer: one task owns the RS-485 serial port.
//!
//! The I/O task is the only code that touches the device. It feeds a
//! bounded queue of parsed frames (depth 64, oldest dropped on overflow)
//! and executes write commands sent over a channel, so writes are
//! naturally serialized and the byte-level parser never contends with the
//! frame consumer.
//!
//! Half-duplex discipline: a send with `flush_after` first drains the
//! transmit path to the wire, then clears the OS receive buffer. That
//! order discards our own transceiver echo and any bus traffic that
//! overlapped the transmission.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::protocol::{Frame, FrameCodec};

/// Parsed frames buffered between the I/O task and the consumer.
const FRAME_QUEUE_DEPTH: usize = 64;
/// How long the I/O task blocks in a read before re-checking for commands.
const READ_TICK: Duration = Duration::from_millis(50);
/// Delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What the bus engine needs from a transport. `SerialLink` is the real
/// implementation; tests drive the engine through a scripted one.
#[async_trait]
pub trait BusPort: Send + Sync {
    fn connected(&self) -> bool;
    /// Next complete, CRC-valid frame, or `None` if none arrives in time.
    async fn receive_frame(&self, timeout: Duration) -> Option<Frame>;
    /// Write one serialized frame. See the module docs for `flush_after`.
    async fn send_frame(&self, frame: &Frame, flush_after: bool) -> bool;
    /// Drop buffered bytes and queued frames.
    async fn reset_rx(&self);
}

enum IoCmd {
    Send {
        bytes: Vec<u8>,
        flush_after: bool,
        done: oneshot::Sender<bool>,
    },
    ResetRx,
}

struct Shared {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    connected: AtomicBool,
}

impl Shared {
    fn push_frame(&self, frame: Frame) {
        let mut queue = self.queue.lock();
        if queue.len() >= FRAME_QUEUE_DEPTH {
            queue.pop_front();
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }

    fn clear_queue(&self) {
        self.queue.lock().clear();
    }
}

/// Handle to the serial port. Cheap to share; all state lives behind the
/// I/O task and the frame queue.
pub struct SerialLink {
    port_path: String,
    baudrate: u32,
    shared: Arc<Shared>,
    cmd_tx: Mutex<Option<mpsc::Sender<IoCmd>>>,
}

impl SerialLink {
    pub fn new(port_path: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port_path: port_path.into(),
            baudrate,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                connected: AtomicBool::new(false),
            }),
            cmd_tx: Mutex::new(None),
        }
    }

    /// RS-485 adapters latch up occasionally; opening the port once at
    /// 9600 baud and closing it again resets the transceiver before the
    /// real open.
    fn baud_toggle_reset(&self) {
        match tokio_serial::new(&self.port_path, 9600).open_native_async() {
            Ok(port) => drop(port),
            Err(e) => debug!("baud toggle reset failed (non-fatal): {e}"),
        }
    }

    /// Open the device and start the I/O task. Returns false when the
    /// port cannot be opened; the reconnect loop will try again.
    pub async fn connect(&self) -> bool {
        if self.connected() {
            return true;
        }

        self.baud_toggle_reset();

        let port = match tokio_serial::new(&self.port_path, self.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
        {
            Ok(port) => port,
            Err(e) => {
                warn!("failed to open {}: {e}", self.port_path);
                return false;
            }
        };

        info!("connected to {} at {} baud", self.port_path, self.baudrate);

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        self.shared.clear_queue();
        self.shared.connected.store(true, Ordering::SeqCst);
        *self.cmd_tx.lock() = Some(cmd_tx);
        tokio::spawn(io_task(port, cmd_rx, Arc::clone(&self.shared)));
        true
    }

    /// Close the link. The I/O task exits when its command channel drops.
    pub async fn disconnect(&self) {
        self.cmd_tx.lock().take();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.clear_queue();
        self.shared.notify.notify_waiters();
    }

    /// Keep the link alive: re-open the port whenever it drops.
    pub fn start_reconnect_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !link.connected() {
                    info!("serial link down, attempting reconnect");
                    link.connect().await;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<IoCmd>> {
        self.cmd_tx.lock().clone()
    }
}

#[async_trait]
impl BusPort for SerialLink {
    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn receive_frame(&self, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the wakeup before checking the queue so a frame pushed
            // in between cannot be missed.
            let notified = self.shared.notify.notified();
            if let Some(frame) = self.shared.queue.lock().pop_front() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    async fn send_frame(&self, frame: &Frame, flush_after: bool) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();
        let cmd = IoCmd::Send {
            bytes: frame.to_bytes(),
            flush_after,
            done: done_tx,
        };
        if tx.send(cmd).await.is_err() {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    async fn reset_rx(&self) {
        self.shared.clear_queue();
        if let Some(tx) = self.sender() {
            let _ = tx.send(IoCmd::ResetRx).await;
        }
    }
}

/// The device-owning task: drains pending commands, then reads for one
/// tick and feeds the frame decoder. Exits on I/O error or when the link
/// handle drops the command channel.
async fn io_task(mut port: SerialStream, mut cmd_rx: mpsc::Receiver<IoCmd>, shared: Arc<Shared>) {
    let mut codec = FrameCodec::new();
    let mut rx_buf = BytesMut::with_capacity(4096);

    loop {
        // Commands first so a pending send never waits behind a read tick.
        loop {
            match cmd_rx.try_recv() {
                Ok(IoCmd::Send {
                    bytes,
                    flush_after,
                    done,
                }) => {
                    let ok = write_frame_bytes(&mut port, &bytes, flush_after).await;
                    if ok && flush_after {
                        // Everything buffered before the flush is stale.
                        rx_buf.clear();
                        shared.clear_queue();
                    }
                    let _ = done.send(ok);
                    if !ok {
                        shared.connected.store(false, Ordering::SeqCst);
                        shared.notify.notify_waiters();
                        return;
                    }
                }
                Ok(IoCmd::ResetRx) => {
                    rx_buf.clear();
                    shared.clear_queue();
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        rx_buf.reserve(1024);
        match tokio::time::timeout(READ_TICK, port.read_buf(&mut rx_buf)).await {
            Err(_) => continue, // tick elapsed with no traffic
            Ok(Ok(0)) => {
                warn!("serial port returned EOF, marking disconnected");
                shared.connected.store(false, Ordering::SeqCst);
                shared.notify.notify_waiters();
                return;
            }
            Ok(Ok(_)) => {
                while let Ok(Some(frame)) = codec.decode(&mut rx_buf) {
                    shared.push_frame(frame);
                }
            }
            Ok(Err(e)) => {
                warn!("serial read error: {e}");
                shared.connected.store(false, Ordering::SeqCst);
                shared.notify.notify_waiters();
                return;
            }
        }
    }
}

async fn write_frame_bytes(port: &mut SerialStream, bytes: &[u8], flush_after: bool) -> bool {
    if let Err(e) = port.write_all(bytes).await {
        warn!("serial write error: {e}");
        return false;
    }
    if flush_after {
        // Drain TX to the wire first, then discard what the transceiver
        // echoed back at us while transmitting.
        if let Err(e) = port.flush().await {
            warn!("serial flush error: {e}");
            return false;
        }
        if let Err(e) = tokio_serial::SerialPort::clear(port, ClearBuffer::Input) {
            debug!("failed to clear input buffer: {e}");
        }
    }
    true
}
