// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the EPIC protocol spoken over AFK rings: the frame
//! headers that follow each queue entry, the command and service call
//! payloads, service announcements, and the mailbox messages used to set the
//! rings up.

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod mailbox;
pub mod props;

use props::ServiceInit;
use thiserror::Error;
use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

wire_enum! {
    /// The frame type, carried in the queue entry's `type` field.
    pub struct EpicType(u32) {
        NOTIFY = 0,
        COMMAND = 3,
        REPLY = 4,
        NOTIFY_ACK = 8,
    }
}

wire_enum! {
    pub struct Category(u8) {
        REPORT = 0x00,
        NOTIFY = 0x10,
        REPLY = 0x20,
        COMMAND = 0x30,
    }
}

wire_enum! {
    pub struct Subtype(u16) {
        ANNOUNCE = 0x30,
        TEARDOWN = 0x32,
        STD_SERVICE = 0xc0,
    }
}

pub const EPIC_HEADER_VERSION: u8 = 2;
pub const EPIC_SUB_HEADER_VERSION: u8 = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct EpicHeader {
    pub version: u8,
    pub pad: u8,
    pub seq: U16,
    pub reserved: U32,
    pub timestamp: U64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct EpicSubHeader {
    /// The payload length.
    pub length: U32,
    pub version: u8,
    pub category: u8,
    pub typ: U16,
    pub timestamp: U64,
    pub tag: U16,
    pub inline_len: U16,
}

/// Both EPIC headers, as they appear after the queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct FrameHeaders {
    pub header: EpicHeader,
    pub sub: EpicSubHeader,
}

pub const FRAME_HEADERS_SIZE: usize = size_of::<FrameHeaders>();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0:#x} bytes is too short for the epic headers")]
    TooShort(usize),
    #[error("payload of {0:#x} bytes does not fit the epic headers")]
    PayloadTooLarge(usize),
}

impl FrameHeaders {
    /// Builds the headers for an outgoing frame with a `payload_len` byte
    /// payload.
    ///
    /// The length field is 32 bits wide, and a reply's inline length is 16
    /// bits, so larger payloads are rejected.
    pub fn new(
        seq: u16,
        category: Category,
        subtype: Subtype,
        tag: u16,
        payload_len: usize,
    ) -> Result<Self, FrameError> {
        let too_large = |_| FrameError::PayloadTooLarge(payload_len);
        let length = u32::try_from(payload_len).map_err(too_large)?;
        let inline_len = if category == Category::REPLY {
            u16::try_from(payload_len.saturating_sub(4)).map_err(too_large)?
        } else {
            0
        };
        Ok(Self {
            header: EpicHeader {
                version: EPIC_HEADER_VERSION,
                pad: 0,
                seq: seq.into(),
                reserved: 0.into(),
                timestamp: 0.into(),
            },
            sub: EpicSubHeader {
                length: length.into(),
                version: EPIC_SUB_HEADER_VERSION,
                category: category.0,
                typ: subtype.0.into(),
                timestamp: 0.into(),
                tag: tag.into(),
                inline_len: inline_len.into(),
            },
        })
    }

    /// Splits a frame into its headers and payload.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), FrameError> {
        Self::read_from_prefix(data).map_err(|_| FrameError::TooShort(data.len()))
    }

    pub fn seq(&self) -> u16 {
        self.header.seq.get()
    }

    pub fn category(&self) -> Category {
        Category(self.sub.category)
    }

    pub fn subtype(&self) -> Subtype {
        Subtype(self.sub.typ.get())
    }

    pub fn tag(&self) -> u16 {
        self.sub.tag.get()
    }
}

/// The payload of a command frame. The request and reply data travel in
/// separate DMA buffers.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct Command {
    pub retcode: U32,
    /// Device address of the buffer the coprocessor writes the reply to.
    pub rxbuf: U64,
    /// Device address of the request buffer.
    pub txbuf: U64,
    pub rxlen: U32,
    pub txlen: U32,
    pub rxcookie: u8,
    pub txcookie: u8,
}

pub const SERVICE_CALL_MAGIC: u32 = 0x6970_6378;

/// The header of a standard service call, placed at the start of the request
/// buffer and echoed back in the reply buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ServiceCall {
    pub pad0: [u8; 2],
    pub group: U16,
    pub command: U32,
    pub data_len: U32,
    pub magic: U32,
    pub pad1: [u8; 48],
}

impl ServiceCall {
    pub fn new(group: u16, command: u32, data_len: u32) -> Self {
        Self {
            pad0: [0; 2],
            group: group.into(),
            command: command.into(),
            data_len: data_len.into(),
            magic: SERVICE_CALL_MAGIC.into(),
            pad1: [0; 48],
        }
    }

    /// Returns true if this is a valid reply to a call of `group` and
    /// `command`.
    pub fn is_reply_to(&self, group: u16, command: u32) -> bool {
        self.magic.get() == SERVICE_CALL_MAGIC
            && self.group.get() == group
            && self.command.get() == command
    }
}

/// The header of a call the coprocessor makes into a host service. The reply
/// echoes it.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct StdServiceApCall {
    pub unk0: U32,
    pub unk1: U32,
    pub typ: U32,
    /// The length of the request data following this header, and the
    /// maximum length of the reply data.
    pub len: U32,
    pub magic: U32,
    pub pad: [u8; 48],
}

pub const ANNOUNCE_NAME_SIZE: usize = 32;

/// Property lists this short or shorter are not parsed.
pub const ANNOUNCE_MIN_PROPS: usize = 36;

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("announce payload of {0:#x} bytes is too short")]
    TooShort(usize),
    #[error("invalid announce property list")]
    Props(#[from] props::Error),
}

/// A decoded service announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announce {
    /// The name from the fixed size name field.
    pub name: String,
    /// The identity from the property list, if one was attached.
    pub init: Option<ServiceInit>,
}

impl Announce {
    pub fn parse(payload: &[u8]) -> Result<Self, AnnounceError> {
        let (name, prop_data) = payload
            .split_at_checked(ANNOUNCE_NAME_SIZE)
            .ok_or(AnnounceError::TooShort(payload.len()))?;
        let name = match name.iter().position(|&b| b == 0) {
            Some(nul) => &name[..nul],
            None => name,
        };
        let name = String::from_utf8_lossy(name).into_owned();

        let init = if prop_data.len() > ANNOUNCE_MIN_PROPS {
            let value = props::parse(prop_data)?;
            Some(props::parse_service_init(&value)?)
        } else {
            None
        };
        Ok(Self { name, init })
    }

    /// The name to match against the known capabilities: the provider class
    /// when a property list was attached, the literal name otherwise.
    pub fn service_name(&self) -> &str {
        match &self.init {
            Some(init) => &init.class,
            None => &self.name,
        }
    }

    /// Encodes an announcement payload.
    #[cfg(any(test, feature = "test_util"))]
    pub fn build(name: &str, props: &[u8]) -> Vec<u8> {
        let mut payload = vec![0; ANNOUNCE_NAME_SIZE];
        let len = name.len().min(ANNOUNCE_NAME_SIZE - 1);
        payload[..len].copy_from_slice(&name.as_bytes()[..len]);
        payload.extend_from_slice(props);
        payload
    }
}
