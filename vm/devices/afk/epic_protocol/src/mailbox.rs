// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The 64-bit mailbox messages that drive the ring handshake of an AFK
//! endpoint. The message type is always in bits 63:48.

use afk_ring::BLOCK_SHIFT;
use bitfield_struct::bitfield;

wire_enum! {
    pub struct MessageType(u16) {
        /// Host to coprocessor: start the handshake. Coprocessor to host:
        /// allocate the round-trip buffers.
        INIT = 0x80,
        INIT_ACK = 0xa0,
        /// Request for the scratch buffer that will hold both rings.
        GETBUF = 0x89,
        GETBUF_ACK = 0xa1,
        INIT_TX = 0x8a,
        INIT_RX = 0x8b,
        INIT_RXTX_ACK = 0x8c,
        START = 0xa3,
        START_ACK = 0x86,
        /// The host advanced the TX write pointer.
        SEND = 0xa2,
        /// The coprocessor advanced the RX write pointer.
        RECV = 0x85,
        SHUTDOWN = 0xc0,
        SHUTDOWN_ACK = 0xc1,
    }
}

impl MessageType {
    /// Returns a message of this type with no payload.
    pub fn message(self) -> u64 {
        MailboxMessage::new().with_message_type(self.0).into()
    }
}

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MailboxMessage {
    #[bits(48)]
    pub payload: u64,
    pub message_type: u16,
}

impl MailboxMessage {
    pub fn typ(&self) -> MessageType {
        MessageType(self.message_type())
    }
}

/// `GETBUF`: the coprocessor asks for a scratch buffer.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct GetBuf {
    pub tag: u16,
    pub size_blocks: u16,
    _reserved: u16,
    pub message_type: u16,
}

impl GetBuf {
    /// The requested size in bytes.
    pub fn size(&self) -> usize {
        (self.size_blocks() as usize) << BLOCK_SHIFT
    }
}

/// `GETBUF_ACK`: the device address of the scratch buffer.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct GetBufAck {
    #[bits(48)]
    pub device_address: u64,
    pub message_type: u16,
}

impl GetBufAck {
    pub fn for_address(device_address: u64) -> Self {
        Self::new()
            .with_device_address(device_address)
            .with_message_type(MessageType::GETBUF_ACK.0)
    }
}

/// `INIT_RX` and `INIT_TX`: where a ring lives within the scratch buffer.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct InitRing {
    pub tag: u16,
    pub size_blocks: u16,
    pub offset_blocks: u16,
    pub message_type: u16,
}

impl InitRing {
    /// The offset of the ring within the scratch buffer, in bytes.
    pub fn offset(&self) -> usize {
        (self.offset_blocks() as usize) << BLOCK_SHIFT
    }

    /// The total size of the ring including its header blocks, in bytes.
    pub fn size(&self) -> usize {
        (self.size_blocks() as usize) << BLOCK_SHIFT
    }
}

/// `SEND`: the new TX write pointer.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct SendMessage {
    pub wptr: u32,
    _reserved: u16,
    pub message_type: u16,
}

impl SendMessage {
    pub fn for_wptr(wptr: u32) -> Self {
        Self::new()
            .with_wptr(wptr)
            .with_message_type(MessageType::SEND.0)
    }
}
