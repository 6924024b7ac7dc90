// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The endpoint object, its lifecycle, and the send path.

use crate::capability::CapabilityTable;
use crate::command::NoSlot;
use crate::command::TimedOut;
use crate::dispatch::Dispatcher;
use crate::dma::AllocError;
use crate::dma::DmaAllocator;
use crate::registry::Registry;
use crate::registry::Service;
use crate::Doorbell;
use crate::EndpointConfig;
use afk_ring::CoherentMem;
use afk_ring::OutgoingRing;
use afk_ring::RingMem;
use afk_ring::RingRegion;
use afk_ring::WriteError;
use epic_protocol::mailbox::MessageType;
use epic_protocol::mailbox::SendMessage;
use epic_protocol::Category;
use epic_protocol::Command;
use epic_protocol::EpicType;
use epic_protocol::FrameError;
use epic_protocol::FrameHeaders;
use epic_protocol::ServiceCall;
use epic_protocol::Subtype;
use futures::channel::mpsc;
use futures::executor::block_on;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// The lifecycle of an endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Cold,
    /// INIT sent.
    AwaitingInitAck,
    /// The coprocessor acknowledged INIT and will ask for the scratch buffer.
    AwaitingBuffer,
    /// The scratch buffer is allocated; waiting for both ring geometries.
    AwaitingRingsReady,
    Ready,
    /// SHUTDOWN sent.
    AwaitingShutdownAck,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("cannot start an endpoint in state {0:?}")]
    InvalidState(EndpointState),
    #[error("timed out starting the endpoint in state {0:?}")]
    TimedOut(EndpointState),
    #[error("failed to allocate a handshake buffer")]
    Allocation(#[source] AllocError),
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("timed out waiting for the shutdown acknowledgement")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("the transmit ring is not set up")]
    NotReady,
    #[error("failed to place the frame")]
    Ring(#[from] WriteError),
    #[error("failed to build the frame headers")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("the endpoint is gone")]
    EndpointGone,
    #[error("the service is gone")]
    ServiceGone,
    #[error("the service on channel {0} was torn down")]
    Disabled(u32),
    #[error("failed to send the command")]
    Send(#[source] SendError),
    #[error(transparent)]
    NoSlot(#[from] NoSlot),
    #[error(transparent)]
    TimedOut(#[from] TimedOut),
    #[error("failed to allocate command buffers")]
    Allocation(#[from] AllocError),
    #[error("command failed with retcode {0:#x}")]
    Retcode(u32),
    #[error("invalid service call reply")]
    InvalidReply,
    #[error("command buffer of {0:#x} bytes is too large")]
    TooLarge(usize),
}

impl CommandError {
    /// Returns true for the capacity failures that go away once earlier
    /// commands complete.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommandError::NoSlot(_) | CommandError::Send(SendError::Ring(WriteError::NoSpace(_)))
        )
    }
}

/// The reply to a command.
#[derive(Debug)]
pub struct CommandReply {
    pub retcode: u32,
    /// The reply buffer, `output_len` bytes long.
    pub output: Vec<u8>,
}

#[derive(Debug)]
struct Status {
    state: EndpointState,
    alloc_error: Option<AllocError>,
}

pub(crate) struct TxState {
    pub ring: Option<OutgoingRing<RingRegion<CoherentMem>>>,
    seq: u16,
}

/// State shared by the endpoint, its worker and the service handles.
pub(crate) struct EndpointInner {
    pub id: u8,
    pub config: EndpointConfig,
    doorbell: Arc<dyn Doorbell>,
    pub dma: Arc<dyn DmaAllocator>,
    pub registry: Mutex<Registry>,
    pub tx: Mutex<TxState>,
    status: Mutex<Status>,
    status_changed: Condvar,
}

impl std::fmt::Debug for EndpointInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointInner")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("status", &self.status)
            .finish()
    }
}

impl EndpointInner {
    pub fn send_message(&self, message: u64) {
        self.doorbell.send_doorbell(self.id, message);
    }

    pub fn state(&self) -> EndpointState {
        self.status.lock().state
    }

    /// Moves to `to` only from `from`. Returns false if the state was
    /// something else.
    pub fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        let mut status = self.status.lock();
        if status.state != from {
            return false;
        }
        tracing::debug!(endpoint = self.id, ?from, ?to, "endpoint state");
        status.state = to;
        self.status_changed.notify_all();
        true
    }

    /// Records a failed handshake allocation for the starter to pick up.
    pub fn fail_allocation(&self, err: AllocError) {
        let mut status = self.status.lock();
        status.alloc_error = Some(err);
        self.status_changed.notify_all();
    }

    /// Places an EPIC frame on the transmit ring and rings the doorbell.
    pub fn send_frame(
        &self,
        channel: u32,
        tag: u16,
        typ: EpicType,
        category: Category,
        subtype: Subtype,
        payload: &[u8],
    ) -> Result<(), SendError> {
        let mut tx = self.tx.lock();
        let TxState { ring, seq } = &mut *tx;
        let ring = ring.as_ref().ok_or(SendError::NotReady)?;
        let headers = FrameHeaders::new(*seq, category, subtype, tag, payload.len())?;
        let placement = ring.place(channel, typ.0, &[headers.as_bytes(), payload])?;
        *seq = seq.wrapping_add(1);
        tracing::trace!(
            endpoint = self.id,
            channel,
            tag,
            ?typ,
            ?category,
            ?subtype,
            wptr = placement.wptr,
            "sent frame"
        );
        // Still under the lock, so the coprocessor sees write pointers in
        // order.
        self.send_message(SendMessage::for_wptr(placement.wptr).into());
        Ok(())
    }
}

/// One AFK endpoint, owning a ring pair and the services multiplexed on it.
///
/// Mailbox messages from the coprocessor are handed to
/// [`Endpoint::on_doorbell`] and processed in order on a dedicated worker
/// thread.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    sender: mpsc::UnboundedSender<u64>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("inner", &self.inner)
            .field("thread", &self.thread)
            .finish()
    }
}

impl Endpoint {
    /// Creates endpoint `id` and starts its worker. The handshake begins
    /// with [`Endpoint::start`].
    pub fn new(
        id: u8,
        config: EndpointConfig,
        table: CapabilityTable,
        doorbell: Arc<dyn Doorbell>,
        dma: Arc<dyn DmaAllocator>,
    ) -> std::io::Result<Self> {
        let inner = Arc::new(EndpointInner {
            id,
            registry: Mutex::new(Registry::new(Arc::new(table), config.max_channels)),
            config,
            doorbell,
            dma,
            tx: Mutex::new(TxState { ring: None, seq: 0 }),
            status: Mutex::new(Status {
                state: EndpointState::Cold,
                alloc_error: None,
            }),
            status_changed: Condvar::new(),
        });
        let (sender, recv) = mpsc::unbounded();
        let dispatcher = Dispatcher::new(inner.clone());
        let thread = std::thread::Builder::new()
            .name(format!("afk-ep{id:02x}"))
            .spawn(move || block_on(dispatcher.run(recv)))?;
        Ok(Self {
            inner,
            sender,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> u8 {
        self.inner.id
    }

    pub fn state(&self) -> EndpointState {
        self.inner.state()
    }

    pub(crate) fn start_timeout(&self) -> Duration {
        self.inner.config.start_timeout
    }

    /// Queues a mailbox message from the coprocessor. Never blocks.
    pub fn on_doorbell(&self, message: u64) {
        if self.sender.unbounded_send(message).is_err() {
            tracing::warn!(endpoint = self.inner.id, message, "endpoint worker is gone");
        }
    }

    /// Runs the handshake and waits until both rings are up.
    ///
    /// Allowed from [`EndpointState::Cold`] and [`EndpointState::Stopped`].
    /// After a timeout the endpoint is left where the handshake stalled; call
    /// [`Endpoint::shutdown`] before starting again.
    pub fn start(&self) -> Result<(), StartError> {
        self.begin_start()?;
        self.wait_started(self.inner.config.start_timeout)
    }

    /// Sends INIT without waiting.
    pub(crate) fn begin_start(&self) -> Result<(), StartError> {
        {
            let mut status = self.inner.status.lock();
            match status.state {
                EndpointState::Cold | EndpointState::Stopped => {}
                state => return Err(StartError::InvalidState(state)),
            }
            status.state = EndpointState::AwaitingInitAck;
            status.alloc_error = None;
        }
        tracing::debug!(endpoint = self.inner.id, "starting endpoint");
        self.inner.send_message(MessageType::INIT.message());
        Ok(())
    }

    pub(crate) fn wait_started(&self, timeout: Duration) -> Result<(), StartError> {
        let deadline = Instant::now() + timeout;
        let mut status = self.inner.status.lock();
        let mut timed_out = false;
        loop {
            if let Some(err) = status.alloc_error.take() {
                return Err(StartError::Allocation(err));
            }
            if status.state == EndpointState::Ready {
                return Ok(());
            }
            if timed_out {
                return Err(StartError::TimedOut(status.state));
            }
            timed_out = self
                .inner
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out();
        }
    }

    /// Asks the coprocessor to stop the endpoint and waits for it to
    /// acknowledge. Every service is torn down and the rings are released.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        {
            let mut status = self.inner.status.lock();
            match status.state {
                EndpointState::Cold | EndpointState::Stopped => return Ok(()),
                _ => status.state = EndpointState::AwaitingShutdownAck,
            }
        }
        self.inner.send_message(MessageType::SHUTDOWN.message());

        let mut status = self.inner.status.lock();
        while status.state != EndpointState::Stopped {
            if self
                .inner
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
                && status.state != EndpointState::Stopped
            {
                return Err(ShutdownError::TimedOut);
            }
        }
        Ok(())
    }

    /// The enabled service on `channel`.
    pub fn service(&self, channel: u32) -> Option<Arc<Service>> {
        self.inner.registry.lock().find_by_channel(channel).cloned()
    }

    /// The enabled service matched by `name`.
    pub fn service_by_name(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.registry.lock().find_by_name(name).cloned()
    }

    /// A handle for sending commands on behalf of `service`.
    pub fn handle(&self, service: &Arc<Service>) -> ServiceHandle {
        ServiceHandle::new(&self.inner, service)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.sender.close_channel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(endpoint = self.inner.id, "endpoint worker panicked");
            }
        }
    }
}

/// Sends commands to the coprocessor on behalf of one service.
///
/// The handle does not keep the endpoint or the service alive.
#[derive(Clone)]
pub struct ServiceHandle {
    endpoint: Weak<EndpointInner>,
    service: Weak<Service>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("channel", &self.channel())
            .finish()
    }
}

impl ServiceHandle {
    pub(crate) fn new(endpoint: &Arc<EndpointInner>, service: &Arc<Service>) -> Self {
        Self {
            endpoint: Arc::downgrade(endpoint),
            service: Arc::downgrade(service),
        }
    }

    /// The service's channel, if the service still exists.
    pub fn channel(&self) -> Option<u32> {
        self.service.upgrade().map(|s| s.channel())
    }

    /// Sends a command with request data `payload` and waits for the reply,
    /// which is `output_len` bytes long.
    ///
    /// Blocks for up to the endpoint's command timeout. Must not be called
    /// from a capability callback, which runs on the thread that delivers
    /// the reply.
    pub fn send_command(
        &self,
        subtype: Subtype,
        payload: &[u8],
        output_len: usize,
    ) -> Result<CommandReply, CommandError> {
        let endpoint = self.endpoint.upgrade().ok_or(CommandError::EndpointGone)?;
        let service = self.service.upgrade().ok_or(CommandError::ServiceGone)?;
        if !service.is_enabled() {
            return Err(CommandError::Disabled(service.channel()));
        }
        let rxlen = u32::try_from(output_len).map_err(|_| CommandError::TooLarge(output_len))?;
        let txlen =
            u32::try_from(payload.len()).map_err(|_| CommandError::TooLarge(payload.len()))?;

        let rx = endpoint.dma.allocate_coherent(output_len)?;
        let tx = match endpoint.dma.allocate_coherent(payload.len()) {
            Ok(tx) => tx,
            Err(err) => {
                endpoint.dma.free_coherent(rx);
                return Err(err.into());
            }
        };
        tx.mem().write_at(0, payload);

        let command = Command {
            retcode: 0.into(),
            rxbuf: rx.device_address().into(),
            txbuf: tx.device_address().into(),
            rxlen: rxlen.into(),
            txlen: txlen.into(),
            rxcookie: 0,
            txcookie: 0,
        };

        let pending = service.commands().submit(rx, tx)?;
        let tag = pending.tag();
        if let Err(err) = endpoint.send_frame(
            service.channel(),
            tag,
            EpicType::COMMAND,
            Category::COMMAND,
            subtype,
            command.as_bytes(),
        ) {
            pending.discard();
            return Err(CommandError::Send(err));
        }

        match pending.wait(endpoint.config.command_timeout) {
            Ok(completed) => Ok(CommandReply {
                retcode: completed.retcode,
                output: completed.output,
            }),
            Err(err) => {
                tracing::warn!(
                    endpoint = endpoint.id,
                    channel = service.channel(),
                    tag,
                    "command timed out"
                );
                Err(err.into())
            }
        }
    }

    /// Makes a standard service call: `data` followed by `data_pad` zero
    /// bytes goes out behind a [`ServiceCall`] header, and the first
    /// `output_len` bytes of the reply data come back, zero padded. The
    /// reply buffer has room for `output_len + output_pad` bytes.
    pub fn service_call(
        &self,
        group: u16,
        command: u32,
        data: &[u8],
        data_pad: usize,
        output_len: usize,
        output_pad: usize,
    ) -> Result<Vec<u8>, CommandError> {
        const HEADER_SIZE: usize = size_of::<ServiceCall>();

        let too_large = || CommandError::TooLarge(usize::MAX);
        let data_len = data.len().checked_add(data_pad).ok_or_else(too_large)?;
        let call_len = u32::try_from(data_len).map_err(|_| CommandError::TooLarge(data_len))?;
        let len = output_len
            .checked_add(output_pad)
            .map(|out| out.max(data_len))
            .and_then(|len| len.checked_add(HEADER_SIZE))
            .ok_or_else(too_large)?;
        // Checked before allocating the request.
        u32::try_from(len).map_err(|_| CommandError::TooLarge(len))?;
        let mut request = vec![0; len];
        let call = ServiceCall::new(group, command, call_len);
        request[..HEADER_SIZE].copy_from_slice(call.as_bytes());
        request[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);

        let reply = self.send_command(Subtype::STD_SERVICE, &request, len)?;
        if reply.retcode != 0 {
            return Err(CommandError::Retcode(reply.retcode));
        }
        let (header, reply_data) =
            ServiceCall::read_from_prefix(&reply.output).map_err(|_| CommandError::InvalidReply)?;
        if !header.is_reply_to(group, command) {
            return Err(CommandError::InvalidReply);
        }

        let retlen = (header.data_len.get() as usize)
            .min(output_len)
            .min(reply_data.len());
        let mut output = vec![0; output_len];
        output[..retlen].copy_from_slice(&reply_data[..retlen]);
        Ok(output)
    }
}
