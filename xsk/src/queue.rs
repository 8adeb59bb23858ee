//
// queue.rs - Packet Pipelines over One AF_XDP Queue
//
// Purpose:
//   This module wraps a single (interface, queue) endpoint behind
//   packet-in/packet-out interfaces: a receive worker that hands incoming
//   frames to a handler or a bounded channel, and a send worker that
//   drains a bounded channel into the tx ring.
//
// How it works:
//   - The umem frame population is split in half: the lower half backs
//     transmissions, the upper half is cycled through the fill ring for
//     receive.
//   - Each worker is an OS thread multiplexing the socket descriptor and
//     a stop pipe in one poll; writing a byte into the pipe cancels the
//     worker at the next poll return. The send worker additionally
//     selects a stop channel while waiting on its packet mailbox.
//   - Worker state (rings, free list) travels into the thread and comes
//     back on join, so a stopped direction can be started again.
//
// Main components:
//   - XskQueue: open/start/stop/close lifecycle.
//   - RxState/TxState: the per-direction state owned by the workers.
//

use crate::packet::{FramePacket, Packet};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread::JoinHandle;
use std::{error, fmt, io};
use xsk_socket::{
    OwnedMmap, RingCons, RingProd, Socket, SocketConfig, Umem, UmemConfig, XdpDesc, XskError,
};

/// Configuration of a queue pipeline.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Total number of umem frames, split evenly between send and
    /// receive.
    pub num_frames: u32,
    pub frame_size: u32,
    /// Forwarded to socket creation; pass
    /// [`xsk_socket::INHIBIT_PROG_LOAD`] to skip attaching the default
    /// redirect program.
    pub libbpf_flags: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            num_frames: 2048,
            frame_size: 4096,
            libbpf_flags: 0,
        }
    }
}

#[derive(Debug)]
pub enum QueueError {
    /// A receive worker is already running on this queue.
    RecvRunning,
    /// A receive channel is already running on this queue.
    RecvChanRunning,
    /// A send channel is already running on this queue.
    SendChanRunning,
    /// Failure from the underlying endpoint.
    Socket(XskError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::RecvRunning => write!(f, "another receive worker is running"),
            QueueError::RecvChanRunning => write!(f, "another receive channel is running"),
            QueueError::SendChanRunning => write!(f, "another send channel is running"),
            QueueError::Socket(err) => write!(f, "{err}"),
        }
    }
}

impl error::Error for QueueError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            QueueError::Socket(err) => Some(err),
            _ => None,
        }
    }
}

impl From<XskError> for QueueError {
    fn from(err: XskError) -> Self {
        QueueError::Socket(err)
    }
}

/// The umem frame area as seen by the workers.
#[derive(Clone, Copy)]
struct UmemRegion {
    ptr: *mut u8,
    len: usize,
}

// Frame halves are touched by exactly one worker each; the region handle
// is just a pointer and a bound.
unsafe impl Send for UmemRegion {}

impl UmemRegion {
    unsafe fn slice(&self, addr: u64, len: usize) -> &[u8] {
        debug_assert!(addr as usize + len <= self.len);
        std::slice::from_raw_parts(self.ptr.add(addr as usize), len)
    }

    unsafe fn slice_mut(&self, addr: u64, len: usize) -> &mut [u8] {
        debug_assert!(addr as usize + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(addr as usize), len)
    }
}

/// Receive-side state owned by the receive worker while it runs.
struct RxState {
    rx: RingCons<XdpDesc>,
    fill: RingProd<u64>,
    free: VecDeque<u64>,
    umem: UmemRegion,
    fd: RawFd,
    batch: u32,
}

/// Send-side state owned by the send worker while it runs.
struct TxState {
    tx: RingProd<XdpDesc>,
    comp: RingCons<u64>,
    free: VecDeque<u64>,
    umem: UmemRegion,
    fd: RawFd,
    batch: u32,
}

struct RecvWorker {
    handle: JoinHandle<RxState>,
    stop: OwnedFd,
}

struct SendWorker {
    handle: JoinHandle<TxState>,
    stop_pipe: OwnedFd,
    stop_chan: Sender<()>,
}

/// One AF_XDP queue behind packet-in/packet-out pipelines.
pub struct XskQueue {
    area: OwnedMmap,
    umem: Option<Umem>,
    socket: Option<Socket>,
    fd: RawFd,
    config: QueueConfig,
    rx_state: Option<RxState>,
    tx_state: Option<TxState>,
    recv_worker: Option<RecvWorker>,
    send_worker: Option<SendWorker>,
    recv_chan_running: bool,
}

impl XskQueue {
    /// Opens the queue: allocates the umem, binds the socket and primes
    /// the per-direction free lists. Nothing runs until a start call.
    pub fn open(
        ifname: &str,
        queue_id: u32,
        config: Option<QueueConfig>,
    ) -> Result<XskQueue, QueueError> {
        let config = config.unwrap_or_default();
        let half = config.num_frames / 2;

        let area = OwnedMmap::anon(config.num_frames as usize * config.frame_size as usize)
            .map_err(|err| XskError::Os {
                op: "allocate umem area",
                err,
            })?;

        let mut umem = Umem::create(
            area.as_void_ptr(),
            config.num_frames as u64 * config.frame_size as u64,
            Some(UmemConfig {
                fill_size: half,
                comp_size: half,
                frame_size: config.frame_size,
                frame_headroom: 0,
                flags: 0,
            }),
        )?;

        let created = Socket::create(
            ifname,
            queue_id,
            &mut umem,
            true,
            true,
            Some(SocketConfig {
                rx_size: half,
                tx_size: half,
                libbpf_flags: config.libbpf_flags,
                xdp_flags: libbpf_sys::XDP_FLAGS_SKB_MODE,
                bind_flags: libc::XDP_USE_NEED_WAKEUP,
            }),
        );
        let (socket, rings) = match created {
            Ok(created) => created,
            Err(err) => {
                if let Err((_, del_err)) = umem.delete() {
                    log::warn!("failed to delete umem during unwind: {del_err}");
                }
                return Err(err.into());
            }
        };
        let (Some(rx), Some(tx), Some(fill), Some(comp)) =
            (rings.rx, rings.tx, rings.fill, rings.comp)
        else {
            return Err(XskError::Invalid("queue socket came without rings").into());
        };

        let fd = socket.fd();
        let mut queue = XskQueue {
            area,
            umem: Some(umem),
            socket: Some(socket),
            fd,
            config,
            rx_state: None,
            tx_state: None,
            recv_worker: None,
            send_worker: None,
            recv_chan_running: false,
        };

        let region = UmemRegion {
            ptr: queue.area.as_u8_ptr(),
            len: queue.area.len(),
        };
        let frame_size = config.frame_size as u64;
        // Lower half of the umem for transmit, upper half for receive.
        let tx_free: VecDeque<u64> = (0..half as u64).map(|i| i * frame_size).collect();
        let rx_free: VecDeque<u64> = (half as u64..config.num_frames as u64)
            .map(|i| i * frame_size)
            .collect();

        queue.rx_state = Some(RxState {
            rx,
            fill,
            free: rx_free,
            umem: region,
            fd,
            batch: half,
        });
        queue.tx_state = Some(TxState {
            tx,
            comp,
            free: tx_free,
            umem: region,
            fd,
            batch: half,
        });
        Ok(queue)
    }

    /// The underlying socket descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Starts the receive worker: every received frame is handed to
    /// `handler`, then recycled onto the fill ring.
    ///
    /// # How it works
    ///
    /// The worker claims received descriptors in batches, invokes the
    /// handler on each payload, returns the frame addresses to its free
    /// list, refills the fill ring, and then polls the socket together
    /// with its stop pipe. [`XskQueue::stop_recv`] makes the pipe
    /// readable, which ends the loop at the next poll return, at most
    /// one ring batch later.
    ///
    /// # Arguments
    /// * `poll_timeout` - Poll timeout in milliseconds; -1 blocks.
    /// * `handler` - Invoked with each received payload. The slice is
    ///   only valid for the duration of the call; copy out what must
    ///   outlive it.
    ///
    /// # Errors
    /// Fails with [`QueueError::RecvRunning`] while a receive worker is
    /// active.
    pub fn start_recv<F>(&mut self, poll_timeout: i32, handler: F) -> Result<(), QueueError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if self.recv_worker.is_some() {
            return Err(QueueError::RecvRunning);
        }
        let state = self.rx_state.take().ok_or(QueueError::RecvRunning)?;
        let (stop_rd, stop_wr) = stop_pipe()?;

        let handle = std::thread::spawn(move || recv_loop(state, stop_rd, poll_timeout, handler));
        self.recv_worker = Some(RecvWorker {
            handle,
            stop: stop_wr,
        });
        Ok(())
    }

    /// Starts the receive worker with a bounded channel as the sink.
    /// Frames accepted by `filter` (all, when `None`) are copied into
    /// packets and sent on the channel, blocking the worker when the
    /// channel is full.
    ///
    /// Fails with [`QueueError::RecvChanRunning`] while a receive channel
    /// is active.
    pub fn start_recv_chan(
        &mut self,
        chan_buf_size: usize,
        poll_timeout: i32,
        filter: Option<Box<dyn Fn(&[u8]) -> bool + Send>>,
    ) -> Result<Receiver<Box<FramePacket>>, QueueError> {
        if self.recv_chan_running {
            return Err(QueueError::RecvChanRunning);
        }
        let (pkt_tx, pkt_rx) = bounded(chan_buf_size);
        let handler = move |data: &[u8]| {
            if let Some(filter) = &filter {
                if !filter(data) {
                    return;
                }
            }
            let mut pkt = Box::<FramePacket>::default();
            if pkt.set_data(data).is_err() {
                log::debug!("dropping frame of {} bytes: too large for a packet", data.len());
                return;
            }
            // Back-pressure: block until the consumer catches up. A gone
            // consumer just drops the packet.
            let _ = pkt_tx.send(pkt);
        };
        self.start_recv(poll_timeout, handler)?;
        self.recv_chan_running = true;
        Ok(pkt_rx)
    }

    /// Stops the receive worker (either flavor) and waits for it to
    /// finish. No handler invocation happens after this returns. The
    /// receive channel, if any, disconnects.
    pub fn stop_recv(&mut self) {
        if let Some(worker) = self.recv_worker.take() {
            let buf = [1u8];
            let rc = unsafe {
                libc::write(worker.stop.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1)
            };
            if rc < 0 {
                log::error!("failed to signal receive worker: {}", io::Error::last_os_error());
            }
            match worker.handle.join() {
                Ok(state) => self.rx_state = Some(state),
                Err(_) => log::error!("receive worker panicked"),
            }
            self.recv_chan_running = false;
        }
    }

    /// Starts the send worker: packets sent into the returned channel are
    /// copied into free umem frames and submitted on the tx ring.
    ///
    /// # How it works
    ///
    /// For each packet taken from the mailbox the worker reclaims
    /// completed frames until one is free, then batches up to
    /// `1 + mailbox backlog` packets (bounded by the free frames),
    /// copies every payload into its frame before the descriptors are
    /// published, and polls for POLLOUT to drive the kernel.
    ///
    /// # Arguments
    /// * `chan_buf_size` - Capacity of the packet mailbox.
    /// * `poll_timeout` - Poll timeout in milliseconds; -1 blocks.
    /// * `post_process` - Consumes every packet once its payload has
    ///   been staged, e.g. to return it to a [`crate::PacketPool`].
    ///
    /// Dropping the sender stops the worker once the mailbox drains.
    ///
    /// # Errors
    /// Fails with [`QueueError::SendChanRunning`] while a send worker is
    /// active.
    pub fn start_send_chan(
        &mut self,
        chan_buf_size: usize,
        poll_timeout: i32,
        post_process: Option<Box<dyn FnMut(Box<FramePacket>) + Send>>,
    ) -> Result<Sender<Box<FramePacket>>, QueueError> {
        if self.send_worker.is_some() {
            return Err(QueueError::SendChanRunning);
        }
        let state = self.tx_state.take().ok_or(QueueError::SendChanRunning)?;
        let (pkt_tx, pkt_rx) = bounded(chan_buf_size);
        let (stop_tx, stop_rx) = bounded(1);
        let (stop_rd, stop_wr) = stop_pipe()?;

        let handle = std::thread::spawn(move || {
            send_loop(state, pkt_rx, stop_rx, stop_rd, poll_timeout, post_process)
        });
        self.send_worker = Some(SendWorker {
            handle,
            stop_pipe: stop_wr,
            stop_chan: stop_tx,
        });
        Ok(pkt_tx)
    }

    /// Stops the send worker and waits for it to finish. An in-flight
    /// packet that has not reached the tx ring is dropped.
    pub fn stop_send(&mut self) {
        if let Some(worker) = self.send_worker.take() {
            let buf = [1u8];
            let rc = unsafe {
                libc::write(
                    worker.stop_pipe.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    1,
                )
            };
            if rc < 0 {
                log::error!("failed to signal send worker: {}", io::Error::last_os_error());
            }
            let _ = worker.stop_chan.send(());
            match worker.handle.join() {
                Ok(state) => self.tx_state = Some(state),
                Err(_) => log::error!("send worker panicked"),
            }
        }
    }

    /// Stops both workers and tears down socket, umem and frame area.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.stop_recv();
        self.stop_send();
        // Drop the ring cursors before the umem mappings go.
        self.rx_state = None;
        self.tx_state = None;
        if let (Some(socket), Some(mut umem)) = (self.socket.take(), self.umem.take()) {
            socket.delete(&mut umem);
            if let Err((_, err)) = umem.delete() {
                log::warn!("failed to delete umem: {err}");
            }
        }
    }
}

impl Drop for XskQueue {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn stop_pipe() -> Result<(OwnedFd, OwnedFd), QueueError> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(XskError::Os {
            op: "pipe2",
            err: io::Error::last_os_error(),
        }
        .into());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Polls `fd` for `events` together with the stop pipe; reports whether
/// the stop pipe became readable. Poll failures are retried on the next
/// cycle.
fn poll_stopped(fd: RawFd, events: i16, stop: &OwnedFd, timeout: i32) -> bool {
    let mut fds = [
        libc::pollfd {
            fd,
            events,
            revents: 0,
        },
        libc::pollfd {
            fd: stop.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout) };
    fds[1].revents & libc::POLLIN != 0
}

fn recv_loop<F>(mut state: RxState, stop: OwnedFd, poll_timeout: i32, mut handler: F) -> RxState
where
    F: FnMut(&[u8]),
{
    loop {
        let (n, idx) = state.rx.peek(state.batch);
        for i in 0..n {
            let desc = state.rx.slot(idx.wrapping_add(i));
            handler(unsafe { state.umem.slice(desc.addr, desc.len as usize) });
            state.free.push_back(desc.addr);
        }
        state.rx.release(n);
        refill(&mut state.fill, &mut state.free);
        if poll_stopped(state.fd, libc::POLLIN, &stop, poll_timeout) {
            return state;
        }
    }
}

/// Moves as many free frame addresses as fit onto the fill ring.
fn refill(fill: &mut RingProd<u64>, free: &mut VecDeque<u64>) {
    let want = fill.nb_free(free.len() as u32);
    if let Some(idx) = fill.reserve(want) {
        for i in 0..want {
            if let Some(addr) = free.pop_front() {
                *fill.slot_mut(idx.wrapping_add(i)) = addr;
            }
        }
        fill.submit(want);
    }
}

fn send_loop(
    mut state: TxState,
    pkt_rx: Receiver<Box<FramePacket>>,
    stop_rx: Receiver<()>,
    stop_pipe: OwnedFd,
    poll_timeout: i32,
    mut post_process: Option<Box<dyn FnMut(Box<FramePacket>) + Send>>,
) -> TxState {
    'outer: loop {
        let first = crossbeam_channel::select! {
            recv(stop_rx) -> _ => break 'outer,
            recv(pkt_rx) -> msg => match msg {
                Ok(pkt) => pkt,
                // The sender went away; drain ends the worker.
                Err(_) => break 'outer,
            },
        };

        // At least one frame must be reclaimable before anything can be
        // staged.
        while state.free.is_empty() {
            recycle_comp(&mut state);
            if !state.free.is_empty() {
                break;
            }
            if poll_stopped(state.fd, libc::POLLOUT, &stop_pipe, poll_timeout) {
                break 'outer;
            }
        }

        // Batch the packet in hand with whatever already sits in the
        // mailbox, bounded by the frames available right now.
        let want = (1 + pkt_rx.len()).min(state.free.len());
        let mut batch = Vec::with_capacity(want);
        batch.push(first);
        while batch.len() < want {
            match pkt_rx.try_recv() {
                Ok(pkt) => batch.push(pkt),
                Err(_) => break,
            }
        }

        let nb = batch.len() as u32;
        let mut addrs: Vec<u64> = Vec::with_capacity(batch.len());
        for _ in 0..batch.len() {
            if let Some(addr) = state.free.pop_front() {
                addrs.push(addr);
            }
        }

        // Payloads are fully written before submit publishes the
        // descriptors.
        let mut staged = Vec::with_capacity(batch.len());
        for (pkt, addr) in batch.into_iter().zip(addrs.iter().copied()) {
            let data = pkt.data();
            unsafe { state.umem.slice_mut(addr, data.len()) }.copy_from_slice(data);
            staged.push(XdpDesc::new(addr, data.len() as u32, 0));
            if let Some(post_process) = post_process.as_mut() {
                post_process(pkt);
            }
        }

        let idx = loop {
            match state.tx.reserve(nb) {
                Some(idx) => break idx,
                None => {
                    recycle_comp(&mut state);
                    if poll_stopped(state.fd, libc::POLLOUT, &stop_pipe, poll_timeout) {
                        // The staged frames go back to the free list for
                        // the next start.
                        state.free.extend(addrs);
                        break 'outer;
                    }
                }
            }
        };
        for (i, desc) in staged.iter().enumerate() {
            *state.tx.slot_mut(idx.wrapping_add(i as u32)) = *desc;
        }
        state.tx.submit(nb);

        if poll_stopped(state.fd, libc::POLLOUT, &stop_pipe, poll_timeout) {
            break 'outer;
        }
    }
    state
}

fn recycle_comp(state: &mut TxState) {
    let (n, idx) = state.comp.peek(state.batch);
    for i in 0..n {
        state.free.push_back(state.comp.slot(idx.wrapping_add(i)));
    }
    state.comp.release(n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_pipe_byte_is_observed_by_the_shared_poll() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (stop_rd, stop_wr) = stop_pipe().unwrap();
        // Stand-in for the socket descriptor: an idle pipe read end.
        let (idle_rd, _idle_wr) = stop_pipe().unwrap();

        assert!(!poll_stopped(idle_rd.as_raw_fd(), libc::POLLIN, &stop_rd, 0));

        let buf = [1u8];
        let rc = unsafe {
            libc::write(
                stop_wr.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                1,
            )
        };
        assert_eq!(rc, 1);
        assert!(poll_stopped(idle_rd.as_raw_fd(), libc::POLLIN, &stop_rd, 1000));
    }

    #[test]
    fn default_config() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.num_frames, 2048);
        assert_eq!(cfg.frame_size, 4096);
        assert_eq!(cfg.libbpf_flags, 0);
    }

    #[test]
    fn queue_errors_display() {
        assert_eq!(
            QueueError::RecvRunning.to_string(),
            "another receive worker is running"
        );
        let err = QueueError::Socket(XskError::Busy);
        assert!(err.to_string().contains("busy"));
    }
}
