// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The endpoint worker: handles mailbox messages in order, drives the ring
//! handshake, drains the receive ring and routes each frame.

use crate::capability::ServiceInfo;
use crate::dma::DmaBuffer;
use crate::endpoint::EndpointInner;
use crate::endpoint::EndpointState;
use crate::endpoint::ServiceHandle;
use crate::registry::Service;
use afk_ring::CoherentMem;
use afk_ring::IncomingRing;
use afk_ring::OutgoingRing;
use afk_ring::RingRegion;
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
use epic_protocol::StdServiceApCall;
use epic_protocol::Subtype;
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

type RingMemory = RingRegion<CoherentMem>;

#[derive(Debug, Error)]
enum RingSetupError {
    #[error("no scratch buffer")]
    NoScratch,
    #[error("expected tag {expected:#x} but got {actual:#x}")]
    TagMismatch { expected: u16, actual: u16 },
    #[error("ring is already initialized")]
    AlreadyInitialized,
    #[error("invalid ring geometry")]
    Ring(#[from] afk_ring::Error),
}

#[derive(Debug)]
struct Scratch {
    buffer: DmaBuffer,
    tag: u16,
}

pub(crate) struct Dispatcher {
    inner: Arc<EndpointInner>,
    rx: Option<IncomingRing<RingMemory>>,
    scratch: Option<Scratch>,
    roundtrip: Vec<DmaBuffer>,
}

impl Dispatcher {
    pub fn new(inner: Arc<EndpointInner>) -> Self {
        Self {
            inner,
            rx: None,
            scratch: None,
            roundtrip: Vec::new(),
        }
    }

    pub async fn run(mut self, mut recv: mpsc::UnboundedReceiver<u64>) {
        while let Some(message) = recv.next().await {
            self.handle_message(message);
        }
        tracing::debug!(endpoint = self.inner.id, "endpoint worker exiting");
        self.release();
    }

    fn handle_message(&mut self, message: u64) {
        let typ = MailboxMessage::from(message).typ();
        tracing::trace!(endpoint = self.inner.id, ?typ, message, "mailbox message");
        match typ {
            MessageType::INIT_ACK => {
                if !self.inner.transition(
                    EndpointState::AwaitingInitAck,
                    EndpointState::AwaitingBuffer,
                ) {
                    tracing::debug!(endpoint = self.inner.id, "unexpected INIT_ACK");
                }
            }
            MessageType::INIT => self.init_roundtrip(),
            MessageType::GETBUF => self.getbuf(GetBuf::from(message)),
            MessageType::INIT_RX | MessageType::INIT_TX => {
                let is_rx = typ == MessageType::INIT_RX;
                match self.init_ring(InitRing::from(message), is_rx) {
                    Ok(()) => self.maybe_start(),
                    Err(err) => {
                        tracing::error!(
                            endpoint = self.inner.id,
                            ?typ,
                            error = &err as &dyn std::error::Error,
                            "failed to set up ring"
                        );
                    }
                }
            }
            MessageType::INIT_RXTX_ACK => {}
            MessageType::START_ACK => {
                tracing::debug!(endpoint = self.inner.id, "start acknowledged");
            }
            MessageType::RECV => self.recv(),
            MessageType::SHUTDOWN_ACK => self.shutdown_ack(),
            _ => {
                tracing::error!(endpoint = self.inner.id, ?typ, "unknown mailbox message");
            }
        }
    }

    /// The coprocessor asks for the two round-trip buffers.
    fn init_roundtrip(&mut self) {
        if self.roundtrip.is_empty() {
            let size = self.inner.config.roundtrip_buffer_size;
            for _ in 0..2 {
                match self.inner.dma.allocate_coherent(size) {
                    Ok(buffer) => self.roundtrip.push(buffer),
                    Err(err) => {
                        tracing::error!(
                            endpoint = self.inner.id,
                            error = &err as &dyn std::error::Error,
                            "failed to allocate round-trip buffer"
                        );
                        for buffer in self.roundtrip.drain(..) {
                            self.inner.dma.free_coherent(buffer);
                        }
                        self.inner.fail_allocation(err);
                        return;
                    }
                }
            }
        }
        self.inner.send_message(MessageType::INIT_ACK.message());
    }

    fn getbuf(&mut self, message: GetBuf) {
        let size = message.size();
        let tag = message.tag();
        tracing::debug!(endpoint = self.inner.id, size, tag, "GETBUF");
        let state = self.inner.state();
        if !matches!(
            state,
            EndpointState::AwaitingInitAck | EndpointState::AwaitingBuffer
        ) {
            tracing::warn!(endpoint = self.inner.id, ?state, "unexpected GETBUF");
            return;
        }
        if self.scratch.is_some() {
            tracing::error!(
                endpoint = self.inner.id,
                "got GETBUF but the buffer already exists"
            );
            return;
        }
        let buffer = match self.inner.dma.allocate_coherent(size) {
            Ok(buffer) => buffer,
            Err(err) => {
                tracing::error!(
                    endpoint = self.inner.id,
                    error = &err as &dyn std::error::Error,
                    "failed to allocate scratch buffer"
                );
                self.inner.fail_allocation(err);
                return;
            }
        };
        if !self
            .inner
            .transition(state, EndpointState::AwaitingRingsReady)
        {
            tracing::warn!(endpoint = self.inner.id, "endpoint stopped during GETBUF");
            self.inner.dma.free_coherent(buffer);
            return;
        }
        let device_address = buffer.device_address();
        self.scratch = Some(Scratch { buffer, tag });
        self.inner
            .send_message(GetBufAck::for_address(device_address).into());
    }

    fn init_ring(&mut self, message: InitRing, is_rx: bool) -> Result<(), RingSetupError> {
        let scratch = self.scratch.as_ref().ok_or(RingSetupError::NoScratch)?;
        if message.tag() != scratch.tag {
            return Err(RingSetupError::TagMismatch {
                expected: scratch.tag,
                actual: message.tag(),
            });
        }
        let ready = if is_rx {
            self.rx.is_some()
        } else {
            self.inner.tx.lock().ring.is_some()
        };
        if ready {
            return Err(RingSetupError::AlreadyInitialized);
        }

        let region = RingRegion::new(
            scratch.buffer.mem().clone(),
            message.offset(),
            message.size(),
        )?;
        if is_rx {
            let ring = IncomingRing::new(region)?;
            tracing::debug!(endpoint = self.inner.id, ?ring, "rx ring ready");
            self.rx = Some(ring);
        } else {
            let ring = OutgoingRing::new(region)?;
            tracing::debug!(endpoint = self.inner.id, ?ring, "tx ring ready");
            self.inner.tx.lock().ring = Some(ring);
        }
        Ok(())
    }

    fn maybe_start(&self) {
        if self.rx.is_none() || self.inner.tx.lock().ring.is_none() {
            return;
        }
        let state = self.inner.state();
        if state != EndpointState::AwaitingRingsReady {
            tracing::warn!(endpoint = self.inner.id, ?state, "rings ready but not starting");
            return;
        }
        self.inner.send_message(MessageType::START.message());
        if self
            .inner
            .transition(EndpointState::AwaitingRingsReady, EndpointState::Ready)
        {
            tracing::info!(endpoint = self.inner.id, "endpoint ready");
        }
    }

    fn shutdown_ack(&mut self) {
        let state = self.inner.state();
        if state != EndpointState::AwaitingShutdownAck {
            tracing::warn!(endpoint = self.inner.id, ?state, "unexpected SHUTDOWN_ACK");
            return;
        }
        self.release();
        self.inner
            .transition(EndpointState::AwaitingShutdownAck, EndpointState::Stopped);
    }

    fn recv(&mut self) {
        let Some(rx) = &self.rx else {
            tracing::error!(endpoint = self.inner.id, "got RECV but not ready");
            return;
        };
        for entry in rx.drain() {
            match entry {
                Ok(entry) => {
                    // The read pointer is already past this entry, so copy it
                    // out before anything else.
                    let data = entry.payload.read_to_vec(rx);
                    self.inner
                        .handle_frame(entry.channel, EpicType(entry.typ), &data);
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = self.inner.id,
                        error = &err as &dyn std::error::Error,
                        "dropped corrupt receive ring entries"
                    );
                }
            }
        }
    }

    /// Drops the rings, frees every buffer and tears down every service.
    fn release(&mut self) {
        self.rx = None;
        self.inner.tx.lock().ring = None;
        if let Some(scratch) = self.scratch.take() {
            self.inner.dma.free_coherent(scratch.buffer);
        }
        for buffer in self.roundtrip.drain(..) {
            self.inner.dma.free_coherent(buffer);
        }
        let services = self.inner.registry.lock().drain();
        for service in services {
            service.teardown();
        }
    }
}

impl EndpointInner {
    fn handle_frame(self: &Arc<Self>, channel: u32, typ: EpicType, data: &[u8]) {
        let (headers, payload) = match FrameHeaders::parse(data) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(
                    endpoint = self.id,
                    channel,
                    error = &err as &dyn std::error::Error,
                    "dropping frame"
                );
                return;
            }
        };
        let category = headers.category();
        let subtype = headers.subtype();
        tracing::trace!(
            endpoint = self.id,
            channel,
            ?typ,
            ?category,
            ?subtype,
            tag = headers.tag(),
            len = payload.len(),
            "received frame"
        );

        let service = self.registry.lock().find_by_channel(channel).cloned();
        let Some(service) = service else {
            self.handle_unmatched(channel, typ, category, subtype, payload);
            return;
        };

        if typ == EpicType::NOTIFY && category == Category::REPORT && subtype == Subtype::TEARDOWN
        {
            tracing::debug!(endpoint = self.id, channel, "service teardown");
            service.teardown();
        } else if typ == EpicType::REPLY && category == Category::REPLY {
            self.handle_reply(&service, headers.tag(), payload);
        } else if subtype == Subtype::STD_SERVICE {
            self.handle_std_service(&service, typ, &headers, payload);
        } else {
            tracing::error!(
                endpoint = self.id,
                channel,
                ?typ,
                ?category,
                ?subtype,
                "unhandled frame"
            );
        }
    }

    fn handle_unmatched(
        self: &Arc<Self>,
        channel: u32,
        typ: EpicType,
        category: Category,
        subtype: Subtype,
        payload: &[u8],
    ) {
        if typ != EpicType::NOTIFY && typ != EpicType::REPLY {
            tracing::error!(endpoint = self.id, channel, ?typ, "expected notify");
            return;
        }
        if category != Category::REPORT {
            tracing::error!(endpoint = self.id, channel, ?category, "expected report");
            return;
        }
        if subtype == Subtype::TEARDOWN {
            tracing::debug!(endpoint = self.id, channel, "teardown without service");
            return;
        }
        // Some coprocessors announce with the standard service subtype.
        if subtype != Subtype::ANNOUNCE && subtype != Subtype::STD_SERVICE {
            tracing::error!(endpoint = self.id, channel, ?subtype, "expected announce");
            return;
        }
        self.handle_announce(channel, payload);
    }

    fn handle_announce(self: &Arc<Self>, channel: u32, payload: &[u8]) {
        let announce = match Announce::parse(payload) {
            Ok(announce) => announce,
            Err(err) => {
                tracing::error!(
                    endpoint = self.id,
                    channel,
                    error = &err as &dyn std::error::Error,
                    "invalid announce"
                );
                return;
            }
        };

        let (epic_name, class, unit) = match &announce.init {
            Some(init) => (init.name.clone(), Some(init.class.clone()), init.unit),
            None => (None, None, None),
        };
        let info = ServiceInfo {
            channel,
            name: announce.service_name().to_owned(),
            epic_name,
            class,
            unit,
        };

        let service = match self
            .registry
            .lock()
            .register(info.clone(), self.dma.clone())
        {
            Ok(service) => service,
            Err(err) => {
                tracing::warn!(
                    endpoint = self.id,
                    channel,
                    name = %announce.name,
                    service = %info.name,
                    error = &err as &dyn std::error::Error,
                    "dropping announce"
                );
                return;
            }
        };

        tracing::info!(
            endpoint = self.id,
            channel,
            name = %announce.name,
            service = %info.name,
            "service announced"
        );
        let handle = ServiceHandle::new(self, &service);
        service.with_capability(|cap| cap.init(handle, &info));
    }

    fn handle_reply(&self, service: &Service, tag: u16, payload: &[u8]) {
        let Ok((command, _)) = Command::read_from_prefix(payload) else {
            tracing::error!(
                endpoint = self.id,
                channel = service.channel(),
                len = payload.len(),
                "command reply too small"
            );
            return;
        };
        if let Err(err) = service.commands().complete(tag, command.retcode.get()) {
            tracing::error!(
                endpoint = self.id,
                channel = service.channel(),
                tag,
                error = &err as &dyn std::error::Error,
                "unexpected command reply"
            );
        }
    }

    fn handle_std_service(
        &self,
        service: &Service,
        typ: EpicType,
        headers: &FrameHeaders,
        payload: &[u8],
    ) {
        let channel = service.channel();
        let category = headers.category();
        if typ == EpicType::NOTIFY && category == Category::NOTIFY {
            let Ok((call, rest)) = StdServiceApCall::read_from_prefix(payload) else {
                tracing::warn!(endpoint = self.id, channel, "std service call too small");
                return;
            };
            let len = call.len.get() as usize;
            let Some(request) = rest.get(..len) else {
                tracing::warn!(endpoint = self.id, channel, len, "std service call truncated");
                return;
            };
            let output = match service.with_capability(|cap| cap.call(call.typ.get(), request)) {
                Ok(output) => output,
                Err(err) => {
                    tracing::debug!(
                        endpoint = self.id,
                        channel,
                        call = call.typ.get(),
                        error = &err as &dyn std::error::Error,
                        "std service call failed"
                    );
                    return;
                }
            };

            let header_len = size_of::<StdServiceApCall>();
            let mut reply = vec![0; payload.len()];
            reply[..header_len].copy_from_slice(call.as_bytes());
            let n = output.len().min(len);
            reply[header_len..header_len + n].copy_from_slice(&output[..n]);
            if let Err(err) = self.send_frame(
                channel,
                headers.tag(),
                EpicType::NOTIFY_ACK,
                Category::REPLY,
                Subtype::STD_SERVICE,
                &reply,
            ) {
                tracing::error!(
                    endpoint = self.id,
                    channel,
                    error = &err as &dyn std::error::Error,
                    "failed to send std service reply"
                );
            }
        } else if typ == EpicType::NOTIFY && category == Category::REPORT {
            service.with_capability(|cap| cap.report(headers.subtype().0, payload));
        } else {
            tracing::error!(
                endpoint = self.id,
                channel,
                ?typ,
                ?category,
                "unhandled std service frame"
            );
        }
    }
}
