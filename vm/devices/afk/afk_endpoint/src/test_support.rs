// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated coprocessor for exercising endpoints in tests.

use crate::capability::CallError;
use crate::capability::Capability;
use crate::capability::CapabilityTable;
use crate::capability::ServiceInfo;
use crate::dma::HeapDmaAllocator;
use crate::endpoint::Endpoint;
use crate::endpoint::ServiceHandle;
use crate::Doorbell;
use crate::EndpointConfig;
use afk_ring::CoherentMem;
use afk_ring::IncomingRing;
use afk_ring::OutgoingRing;
use afk_ring::Ring;
use afk_ring::RingMem;
use afk_ring::RingRegion;
use afk_ring::BLOCK_SHIFT;
use afk_ring::BLOCK_SIZE;
use afk_ring::QE_MAGIC_AOP;
use epic_protocol::mailbox::GetBuf;
use epic_protocol::mailbox::GetBufAck;
use epic_protocol::mailbox::InitRing;
use epic_protocol::mailbox::MailboxMessage;
use epic_protocol::mailbox::MessageType;
use epic_protocol::Announce;
use epic_protocol::Category;
use epic_protocol::Command;
use epic_protocol::EpicType;
use epic_protocol::FrameHeaders;
use epic_protocol::Subtype;
use epic_protocol::FRAME_HEADERS_SIZE;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Initializes `tracing` for tests.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let targets = if let Ok(var) = std::env::var("RUST_LOG") {
            var.parse().unwrap()
        } else {
            Targets::new().with_default(LevelFilter::DEBUG)
        };
        tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

/// The body size of each simulated ring.
pub const RING_BODY: usize = 0x1000;
/// The total size of each simulated ring, with 0x40 byte header blocks.
pub const RING_SIZE: usize = 3 * BLOCK_SIZE as usize + RING_BODY;

const SCRATCH_TAG: u16 = 0x4d2;
const TIMEOUT: Duration = Duration::from_secs(5);

/// The coprocessor's side of the two rings.
struct CoproRings {
    /// The endpoint's receive ring.
    to_host: OutgoingRing<RingRegion<CoherentMem>>,
    /// The endpoint's transmit ring.
    from_host: IncomingRing<RingRegion<CoherentMem>>,
}

/// A frame the endpoint sent.
#[derive(Debug)]
pub struct HostFrame {
    pub channel: u32,
    pub typ: EpicType,
    pub headers: FrameHeaders,
    pub payload: Vec<u8>,
}

/// Plays the coprocessor: records mailbox messages from the endpoint,
/// provides its DMA memory, and produces and consumes ring frames.
pub struct FakeCoprocessor {
    messages: Mutex<VecDeque<(u8, u64)>>,
    arrived: Condvar,
    pub dma: Arc<HeapDmaAllocator>,
    rings: Mutex<Option<CoproRings>>,
    seq: AtomicU16,
}

impl Doorbell for FakeCoprocessor {
    fn send_doorbell(&self, endpoint: u8, value: u64) {
        self.messages.lock().push_back((endpoint, value));
        self.arrived.notify_all();
    }
}

impl FakeCoprocessor {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            dma: Arc::new(HeapDmaAllocator::new()),
            rings: Mutex::new(None),
            seq: AtomicU16::new(0),
        }
    }

    pub fn next_message_from(&self, timeout: Duration) -> Option<(u8, u64)> {
        let deadline = Instant::now() + timeout;
        let mut messages = self.messages.lock();
        loop {
            if let Some(message) = messages.pop_front() {
                return Some(message);
            }
            if self
                .arrived
                .wait_until(&mut messages, deadline)
                .timed_out()
            {
                return messages.pop_front();
            }
        }
    }

    pub fn next_message(&self, timeout: Duration) -> Option<u64> {
        self.next_message_from(timeout).map(|(_, message)| message)
    }

    /// Waits for the next message and checks its type.
    pub fn expect(&self, typ: MessageType) -> u64 {
        let message = self
            .next_message(TIMEOUT)
            .unwrap_or_else(|| panic!("no message, expected {typ:?}"));
        assert_eq!(MailboxMessage::from(message).typ(), typ);
        message
    }

    pub fn assert_quiet(&self) {
        if let Some(message) = self.next_message(Duration::from_millis(20)) {
            panic!(
                "unexpected message {:?}",
                MailboxMessage::from(message).typ()
            );
        }
    }

    /// Answers the handshake of an endpoint that is starting.
    pub fn handshake(&self, ep: &Endpoint) {
        let scratch = self.begin_handshake(ep, SCRATCH_TAG);
        let blocks = (RING_SIZE >> BLOCK_SHIFT) as u16;
        ep.on_doorbell(init_ring(MessageType::INIT_RX, SCRATCH_TAG, 0, blocks));
        ep.on_doorbell(init_ring(MessageType::INIT_TX, SCRATCH_TAG, blocks, blocks));
        self.expect(MessageType::START);
        self.finish_handshake(ep, scratch);
    }

    /// Runs the handshake up to the scratch buffer, returning it with the
    /// body sizes of both rings filled in.
    pub fn begin_handshake(&self, ep: &Endpoint, tag: u16) -> CoherentMem {
        self.expect(MessageType::INIT);
        ep.on_doorbell(MessageType::INIT_ACK.message());
        ep.on_doorbell(
            GetBuf::new()
                .with_tag(tag)
                .with_size_blocks((2 * RING_SIZE >> BLOCK_SHIFT) as u16)
                .with_message_type(MessageType::GETBUF.0)
                .into(),
        );
        let ack = GetBufAck::from(self.expect(MessageType::GETBUF_ACK));
        let (scratch, offset) = self
            .dma
            .lookup(ack.device_address())
            .expect("scratch buffer is allocated");
        assert_eq!(offset, 0);
        assert_eq!(scratch.len(), 2 * RING_SIZE);
        for base in [0, RING_SIZE] {
            scratch.store_u32(base, RING_BODY as u32);
        }
        scratch
    }

    /// Acknowledges START, sets up the round-trip buffers and attaches to
    /// the rings.
    pub fn finish_handshake(&self, ep: &Endpoint, scratch: CoherentMem) {
        ep.on_doorbell(MessageType::START_ACK.message());
        ep.on_doorbell(MessageType::INIT.message());
        self.expect(MessageType::INIT_ACK);

        let to_host = RingRegion::new(scratch.clone(), 0, RING_SIZE).unwrap();
        let from_host = RingRegion::new(scratch, RING_SIZE, RING_SIZE).unwrap();
        *self.rings.lock() = Some(CoproRings {
            to_host: OutgoingRing::new(to_host).unwrap().with_magic(QE_MAGIC_AOP),
            from_host: IncomingRing::new(from_host).unwrap(),
        });
    }

    /// Waits until the endpoint has handled every message sent so far.
    pub fn flush(&self, ep: &Endpoint) {
        ep.on_doorbell(MessageType::INIT.message());
        self.expect(MessageType::INIT_ACK);
    }

    /// Places raw frame bytes on the receive ring.
    pub fn send_raw(&self, ep: &Endpoint, channel: u32, typ: EpicType, data: &[&[u8]]) {
        {
            let rings = self.rings.lock();
            let rings = rings.as_ref().expect("rings are set up");
            rings.to_host.place(channel, typ.0, data).unwrap();
        }
        ep.on_doorbell(MessageType::RECV.message());
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_frame(
        &self,
        ep: &Endpoint,
        channel: u32,
        typ: EpicType,
        category: Category,
        subtype: Subtype,
        tag: u16,
        payload: &[u8],
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let headers = FrameHeaders::new(seq, category, subtype, tag, payload.len()).unwrap();
        self.send_raw(ep, channel, typ, &[headers.as_bytes(), payload]);
    }

    pub fn announce(&self, ep: &Endpoint, channel: u32, name: &str, props: &[u8]) {
        self.send_frame(
            ep,
            channel,
            EpicType::NOTIFY,
            Category::REPORT,
            Subtype::ANNOUNCE,
            0,
            &Announce::build(name, props),
        );
    }

    /// Places a frame with a bad queue entry magic without ringing the
    /// doorbell.
    pub fn corrupt_next_entry(&self) {
        let rings = self.rings.lock();
        let ring = &rings.as_ref().expect("rings are set up").to_host;
        let placement = ring
            .place(0, EpicType::NOTIFY.0, &[&[0; FRAME_HEADERS_SIZE]])
            .unwrap();
        ring.mem()
            .store_u32(3 * BLOCK_SIZE as usize + placement.offset as usize, 0xdead_beef);
    }

    /// Waits for SEND and takes the frame off the transmit ring.
    pub fn next_frame(&self) -> HostFrame {
        self.expect(MessageType::SEND);
        let rings = self.rings.lock();
        let ring = &rings.as_ref().expect("rings are set up").from_host;
        let entry = ring.read().expect("frame on the transmit ring");
        let data = entry.payload.read_to_vec(ring);
        let (headers, payload) = FrameHeaders::parse(&data).unwrap();
        HostFrame {
            channel: entry.channel,
            typ: EpicType(entry.typ),
            headers,
            payload: payload.to_vec(),
        }
    }

    /// The request data of a command frame.
    pub fn command_request(&self, frame: &HostFrame) -> Vec<u8> {
        let (command, _) = Command::read_from_prefix(&frame.payload).unwrap();
        let (mem, offset) = self
            .dma
            .lookup(command.txbuf.get())
            .expect("request buffer is allocated");
        let mut data = vec![0; command.txlen.get() as usize];
        mem.read_at(offset, &mut data);
        data
    }

    /// Writes `output` to the reply buffer of a command, if it still exists,
    /// and sends the reply frame.
    pub fn reply(&self, ep: &Endpoint, frame: &HostFrame, retcode: u32, output: &[u8]) {
        let (command, _) = Command::read_from_prefix(&frame.payload).unwrap();
        assert!(output.len() <= command.rxlen.get() as usize);
        if let Some((mem, offset)) = self.dma.lookup(command.rxbuf.get()) {
            mem.write_at(offset, output);
        }
        let reply = Command {
            retcode: retcode.into(),
            ..command
        };
        self.send_frame(
            ep,
            frame.channel,
            EpicType::REPLY,
            Category::REPLY,
            frame.headers.subtype(),
            frame.headers.tag(),
            reply.as_bytes(),
        );
    }
}

fn init_ring(typ: MessageType, tag: u16, offset_blocks: u16, size_blocks: u16) -> u64 {
    InitRing::new()
        .with_tag(tag)
        .with_offset_blocks(offset_blocks)
        .with_size_blocks(size_blocks)
        .with_message_type(typ.0)
        .into()
}

/// An endpoint wired to its own [`FakeCoprocessor`].
pub struct Harness {
    pub copro: Arc<FakeCoprocessor>,
    pub endpoint: Endpoint,
}

impl Harness {
    pub fn new(config: EndpointConfig, table: CapabilityTable) -> Self {
        let copro = Arc::new(FakeCoprocessor::new());
        let endpoint = Endpoint::new(0x20, config, table, copro.clone(), copro.dma.clone())
            .expect("worker thread starts");
        Self { copro, endpoint }
    }

    /// Starts the endpoint, answering the handshake from this thread.
    pub fn start(&self) {
        thread::scope(|s| {
            let starter = s.spawn(|| self.endpoint.start());
            self.copro.handshake(&self.endpoint);
            starter.join().unwrap().unwrap();
        });
    }

    pub fn begin_handshake(&self, tag: u16) -> CoherentMem {
        self.copro.begin_handshake(&self.endpoint, tag)
    }

    pub fn finish_handshake(&self, scratch: CoherentMem) {
        self.copro.finish_handshake(&self.endpoint, scratch)
    }

    pub fn flush(&self) {
        self.copro.flush(&self.endpoint)
    }

    pub fn announce(&self, channel: u32, name: &str, props: &[u8]) {
        self.copro.announce(&self.endpoint, channel, name, props)
    }

    pub fn send_frame(
        &self,
        channel: u32,
        typ: EpicType,
        category: Category,
        subtype: Subtype,
        tag: u16,
        payload: &[u8],
    ) {
        self.copro
            .send_frame(&self.endpoint, channel, typ, category, subtype, tag, payload)
    }

    pub fn send_raw(&self, channel: u32, typ: EpicType, data: &[u8]) {
        self.copro.send_raw(&self.endpoint, channel, typ, &[data])
    }

    pub fn corrupt_next_entry(&self) {
        self.copro.corrupt_next_entry()
    }

    pub fn next_frame(&self) -> HostFrame {
        self.copro.next_frame()
    }

    pub fn command_request(&self, frame: &HostFrame) -> Vec<u8> {
        self.copro.command_request(frame)
    }

    pub fn reply(&self, frame: &HostFrame, retcode: u32, output: &[u8]) {
        self.copro.reply(&self.endpoint, frame, retcode, output)
    }

    /// Polls `cond` until it holds, for the worker to catch up.
    pub fn poll_until(&self, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// What a [`Recorder`] capability saw, by channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Init(u32, String),
    Call(u32, u32, Vec<u8>),
    Report(u32, u16, Vec<u8>),
    Teardown(u32),
}

/// Records every callback of the capabilities it builds. Calls are answered
/// with the request reversed.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    handles: Mutex<BTreeMap<u32, ServiceHandle>>,
}

impl Recorder {
    /// Calls of this type fail.
    pub const UNSUPPORTED: u32 = 0xdead;

    /// A table with a recording capability under each of `names`.
    pub fn table(self: &Arc<Self>, names: &[&str]) -> CapabilityTable {
        names.iter().fold(CapabilityTable::new(), |table, &name| {
            let recorder = self.clone();
            table.with(name, move || {
                Box::new(Recording {
                    recorder: recorder.clone(),
                    channel: 0,
                })
            })
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// The handle passed to the last service initialized on `channel`.
    pub fn handle(&self, channel: u32) -> ServiceHandle {
        self.handles
            .lock()
            .get(&channel)
            .cloned()
            .expect("service was initialized")
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

struct Recording {
    recorder: Arc<Recorder>,
    channel: u32,
}

impl Capability for Recording {
    fn init(&mut self, handle: ServiceHandle, info: &ServiceInfo) {
        self.channel = info.channel;
        self.recorder
            .push(Event::Init(info.channel, info.name.clone()));
        self.recorder.handles.lock().insert(info.channel, handle);
    }

    fn call(&mut self, request_type: u32, request: &[u8]) -> Result<Vec<u8>, CallError> {
        self.recorder
            .push(Event::Call(self.channel, request_type, request.to_vec()));
        if request_type == Recorder::UNSUPPORTED {
            return Err(CallError::Unsupported(request_type));
        }
        Ok(request.iter().rev().copied().collect())
    }

    fn report(&mut self, subtype: u16, data: &[u8]) {
        self.recorder
            .push(Event::Report(self.channel, subtype, data.to_vec()));
    }

    fn teardown(&mut self) {
        self.recorder.push(Event::Teardown(self.channel));
    }
}
