//! IPC message buffer
//!
//! Every thread owns a small message buffer in its thread-local region. An
//! IPC message is a sequence of 32-bit little-endian words:
//!
//! ```text
//! +--------+---------+-----+------+-------+----------+-----------+-----+--------------+
//! | header | special | pid | copy | move  | pointer  | map alias | raw | receive list |
//! | 2 w    | 0/1 w   | 0/2 | n w  | n w   | 2 w each | 3 w each  | n w | 2 w each     |
//! +--------+---------+-----+------+-------+----------+-----------+-----+--------------+
//! ```
//!
//! The layout is binary compatible with the Horizon IPC format. Word indices
//! are derived from the header alone ([`special_data_index`] and friends), so
//! the sender and the receiver always agree on where each part lives.
//!
//! The header can describe messages far larger than the per-thread buffer
//! ([`MAX_MESSAGE_SIZE`] vs [`MESSAGE_BUFFER_SIZE`]). [`MessageBuffer::check_fits`]
//! must accept a header before anything is marshalled against it.

use core::fmt;

use tock_registers::{
    interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};
use zerocopy::FromBytes;

use crate::handle::Handle;
use crate::result::{ResultCode, SvcError, SvcResult};

/// Capacity of the per-thread message buffer in bytes.
pub const MESSAGE_BUFFER_SIZE: usize = 0x100;

/// Capacity of the per-thread message buffer in words.
pub const MESSAGE_BUFFER_WORDS: usize = MESSAGE_BUFFER_SIZE / 4;

// -- Packed word layouts

register_bitfields![u32,
    /// First header word
    pub HeaderWord0 [
        TAG OFFSET(0) NUMBITS(16) [],
        POINTER_COUNT OFFSET(16) NUMBITS(4) [],
        SEND_COUNT OFFSET(20) NUMBITS(4) [],
        RECEIVE_COUNT OFFSET(24) NUMBITS(4) [],
        EXCHANGE_COUNT OFFSET(28) NUMBITS(4) []
    ],

    /// Second header word
    pub HeaderWord1 [
        RAW_COUNT OFFSET(0) NUMBITS(10) [],
        RECEIVE_LIST_COUNT OFFSET(10) NUMBITS(4) [],
        RECEIVE_LIST_OFFSET OFFSET(20) NUMBITS(11) [],
        HAS_SPECIAL_HEADER OFFSET(31) NUMBITS(1) []
    ],

    /// Special header word
    pub SpecialWord [
        HAS_PROCESS_ID OFFSET(0) NUMBITS(1) [],
        COPY_HANDLE_COUNT OFFSET(1) NUMBITS(4) [],
        MOVE_HANDLE_COUNT OFFSET(5) NUMBITS(4) []
    ],

    /// Third map-alias descriptor word
    pub MapAliasWord2 [
        ATTRIBUTE OFFSET(0) NUMBITS(2) [
            Ipc = 0,
            NonSecureIpc = 1,
            NonDeviceIpc = 3
        ],
        ADDRESS_HIGH OFFSET(2) NUMBITS(3) [],
        SIZE_HIGH OFFSET(24) NUMBITS(4) [],
        ADDRESS_MID OFFSET(28) NUMBITS(4) []
    ],

    /// First pointer descriptor word
    pub PointerWord0 [
        INDEX OFFSET(0) NUMBITS(4) [],
        ADDRESS_HIGH OFFSET(6) NUMBITS(3) [],
        ADDRESS_MID OFFSET(12) NUMBITS(4) [],
        SIZE OFFSET(16) NUMBITS(16) []
    ],

    /// Second receive-list entry word
    pub ReceiveListWord1 [
        ADDRESS_HIGH OFFSET(0) NUMBITS(7) [],
        SIZE OFFSET(16) NUMBITS(16) []
    ]
];

const COUNT_MAX: u32 = (1 << 4) - 1;
const RAW_COUNT_MAX: u32 = (1 << 10) - 1;
const RECEIVE_LIST_OFFSET_MAX: u32 = (1 << 11) - 1;

/// Addresses carried in descriptors are at most 39 bits wide.
pub const DESCRIPTOR_ADDRESS_BITS: u32 = 39;

/// Map-alias sizes are at most 36 bits wide.
pub const MAP_ALIAS_SIZE_BITS: u32 = 36;

#[inline]
fn pack<R: tock_registers::RegisterLongName>(
    value: tock_registers::fields::FieldValue<u32, R>,
) -> u32 {
    let reg = InMemoryRegister::<u32, R>::new(0);
    reg.write(value);
    reg.get()
}

#[inline]
fn unpack<R: tock_registers::RegisterLongName>(
    word: u32,
    field: tock_registers::fields::Field<u32, R>,
) -> u32 {
    InMemoryRegister::<u32, R>::new(word).read(field)
}

// -- Receive list count

/// Raw receive-list counts above this value select explicit entries.
pub const RECEIVE_LIST_COUNT_OFFSET: u32 = 2;

/// Largest number of explicit receive-list entries.
pub const RECEIVE_LIST_COUNT_MAX: u32 = COUNT_MAX - RECEIVE_LIST_COUNT_OFFSET;

/// Interpretation of the 4-bit receive-list count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveListCountType {
    /// No receive buffers.
    None,
    /// Pointer data lands inside the message buffer itself.
    ToMessageBuffer,
    /// One receive buffer shared by every pointer descriptor.
    ToSingleBuffer,
    /// One receive buffer per pointer index (1..=13).
    Entries(u32),
}

impl ReceiveListCountType {
    /// Decode the raw header field.
    #[must_use]
    pub const fn from_raw(count: u32) -> Self {
        match count {
            0 => Self::None,
            1 => Self::ToMessageBuffer,
            2 => Self::ToSingleBuffer,
            n => Self::Entries(n - RECEIVE_LIST_COUNT_OFFSET),
        }
    }

    /// Raw header field value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::ToMessageBuffer => 1,
            Self::ToSingleBuffer => 2,
            Self::Entries(n) => n + RECEIVE_LIST_COUNT_OFFSET,
        }
    }

    /// Number of [`ReceiveListEntry`] records that follow the message.
    #[must_use]
    pub const fn entry_count(self) -> usize {
        match self {
            Self::None | Self::ToMessageBuffer => 0,
            Self::ToSingleBuffer => 1,
            Self::Entries(n) => n as usize,
        }
    }

    /// Bytes occupied by the receive list.
    #[must_use]
    pub const fn footprint(self) -> usize {
        self.entry_count() * ReceiveListEntry::WORDS * 4
    }
}

// -- Header

/// Two-word message header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    words: [u32; 2],
}

impl MessageHeader {
    pub const WORDS: usize = 2;

    /// All-zero header; marks an empty buffer.
    pub const NULL: Self = Self { words: [0, 0] };

    /// Build a header. Panics if any count exceeds its field width.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        tag: u16,
        special: bool,
        pointers: u32,
        sends: u32,
        receives: u32,
        exchanges: u32,
        raw: u32,
        receive_list: ReceiveListCountType,
    ) -> Self {
        assert!(pointers <= COUNT_MAX, "pointer count out of range");
        assert!(sends <= COUNT_MAX, "send count out of range");
        assert!(receives <= COUNT_MAX, "receive count out of range");
        assert!(exchanges <= COUNT_MAX, "exchange count out of range");
        assert!(raw <= RAW_COUNT_MAX, "raw count out of range");
        assert!(receive_list.raw() <= COUNT_MAX, "receive list count out of range");

        let w0 = pack(
            HeaderWord0::TAG.val(u32::from(tag))
                + HeaderWord0::POINTER_COUNT.val(pointers)
                + HeaderWord0::SEND_COUNT.val(sends)
                + HeaderWord0::RECEIVE_COUNT.val(receives)
                + HeaderWord0::EXCHANGE_COUNT.val(exchanges),
        );
        let w1 = pack(
            HeaderWord1::RAW_COUNT.val(raw)
                + HeaderWord1::RECEIVE_LIST_COUNT.val(receive_list.raw())
                + HeaderWord1::HAS_SPECIAL_HEADER.val(u32::from(special)),
        );
        Self { words: [w0, w1] }
    }

    /// Reconstruct a header from its two words.
    #[inline]
    #[must_use]
    pub const fn from_words(w0: u32, w1: u32) -> Self {
        Self { words: [w0, w1] }
    }

    #[inline]
    #[must_use]
    pub const fn words(&self) -> [u32; 2] {
        self.words
    }

    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.words[0] == 0 && self.words[1] == 0
    }

    #[must_use]
    pub fn tag(&self) -> u16 {
        unpack(self.words[0], HeaderWord0::TAG) as u16
    }

    #[must_use]
    pub fn pointer_count(&self) -> u32 {
        unpack(self.words[0], HeaderWord0::POINTER_COUNT)
    }

    #[must_use]
    pub fn send_count(&self) -> u32 {
        unpack(self.words[0], HeaderWord0::SEND_COUNT)
    }

    #[must_use]
    pub fn receive_count(&self) -> u32 {
        unpack(self.words[0], HeaderWord0::RECEIVE_COUNT)
    }

    #[must_use]
    pub fn exchange_count(&self) -> u32 {
        unpack(self.words[0], HeaderWord0::EXCHANGE_COUNT)
    }

    /// Send, receive and exchange descriptors together.
    #[must_use]
    pub fn map_alias_count(&self) -> u32 {
        self.send_count() + self.receive_count() + self.exchange_count()
    }

    #[must_use]
    pub fn raw_count(&self) -> u32 {
        unpack(self.words[1], HeaderWord1::RAW_COUNT)
    }

    #[must_use]
    pub fn receive_list_count(&self) -> ReceiveListCountType {
        ReceiveListCountType::from_raw(unpack(self.words[1], HeaderWord1::RECEIVE_LIST_COUNT))
    }

    /// Explicit receive-list word offset; zero means "after the raw data".
    #[must_use]
    pub fn receive_list_offset(&self) -> u32 {
        unpack(self.words[1], HeaderWord1::RECEIVE_LIST_OFFSET)
    }

    #[must_use]
    pub fn has_special_header(&self) -> bool {
        unpack(self.words[1], HeaderWord1::HAS_SPECIAL_HEADER) != 0
    }

    pub fn set_receive_list_count(&mut self, count: ReceiveListCountType) {
        assert!(count.raw() <= COUNT_MAX, "receive list count out of range");
        let reg = InMemoryRegister::<u32, HeaderWord1::Register>::new(self.words[1]);
        reg.modify(HeaderWord1::RECEIVE_LIST_COUNT.val(count.raw()));
        self.words[1] = reg.get();
    }

    pub fn set_receive_list_offset(&mut self, offset: u32) {
        assert!(offset <= RECEIVE_LIST_OFFSET_MAX, "receive list offset out of range");
        let reg = InMemoryRegister::<u32, HeaderWord1::Register>::new(self.words[1]);
        reg.modify(HeaderWord1::RECEIVE_LIST_OFFSET.val(offset));
        self.words[1] = reg.get();
    }
}

impl fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeader")
            .field("tag", &self.tag())
            .field("special", &self.has_special_header())
            .field("pointers", &self.pointer_count())
            .field("sends", &self.send_count())
            .field("receives", &self.receive_count())
            .field("exchanges", &self.exchange_count())
            .field("raw", &self.raw_count())
            .field("receive_list", &self.receive_list_count())
            .field("receive_list_offset", &self.receive_list_offset())
            .finish()
    }
}

// -- Special header

/// Optional word describing the process id and handles carried by a message.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecialHeader {
    word: u32,
    present: bool,
}

impl SpecialHeader {
    /// No special header.
    pub const ABSENT: Self = Self { word: 0, present: false };

    /// Build a present special header. Panics if a count exceeds 15.
    #[must_use]
    pub fn new(process_id: bool, copies: u32, moves: u32) -> Self {
        assert!(copies <= COUNT_MAX, "copy handle count out of range");
        assert!(moves <= COUNT_MAX, "move handle count out of range");
        let word = pack(
            SpecialWord::HAS_PROCESS_ID.val(u32::from(process_id))
                + SpecialWord::COPY_HANDLE_COUNT.val(copies)
                + SpecialWord::MOVE_HANDLE_COUNT.val(moves),
        );
        Self { word, present: true }
    }

    /// Reconstruct from a raw word.
    #[inline]
    #[must_use]
    pub const fn from_word(word: u32, present: bool) -> Self {
        Self { word, present }
    }

    #[inline]
    #[must_use]
    pub const fn word(&self) -> u32 {
        self.word
    }

    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.present
    }

    #[must_use]
    pub fn has_process_id(&self) -> bool {
        unpack(self.word, SpecialWord::HAS_PROCESS_ID) != 0
    }

    #[must_use]
    pub fn copy_handle_count(&self) -> u32 {
        unpack(self.word, SpecialWord::COPY_HANDLE_COUNT)
    }

    #[must_use]
    pub fn move_handle_count(&self) -> u32 {
        unpack(self.word, SpecialWord::MOVE_HANDLE_COUNT)
    }

    /// Bytes taken by the special header word itself.
    #[must_use]
    pub fn header_size(&self) -> usize {
        if self.present { 4 } else { 0 }
    }

    /// Bytes taken by the process id and the handles.
    #[must_use]
    pub fn data_size(&self) -> usize {
        if !self.present {
            return 0;
        }
        let pid = if self.has_process_id() { 8 } else { 0 };
        pid + 4 * (self.copy_handle_count() + self.move_handle_count()) as usize
    }
}

impl fmt::Debug for SpecialHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present {
            return f.write_str("SpecialHeader(absent)");
        }
        f.debug_struct("SpecialHeader")
            .field("pid", &self.has_process_id())
            .field("copies", &self.copy_handle_count())
            .field("moves", &self.move_handle_count())
            .finish()
    }
}

// -- Descriptors

/// Memory attribute requested for a map-alias buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MapAliasAttribute {
    Ipc = 0,
    NonSecureIpc = 1,
    NonDeviceIpc = 3,
}

impl MapAliasAttribute {
    #[must_use]
    pub const fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ipc),
            1 => Some(Self::NonSecureIpc),
            3 => Some(Self::NonDeviceIpc),
            _ => None,
        }
    }
}

/// Send/receive/exchange buffer descriptor (3 words).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MapAliasDescriptor {
    words: [u32; 3],
}

impl MapAliasDescriptor {
    pub const WORDS: usize = 3;

    #[must_use]
    pub fn new(address: u64, size: u64, attribute: MapAliasAttribute) -> Self {
        assert!(address >> DESCRIPTOR_ADDRESS_BITS == 0, "map alias address out of range");
        assert!(size >> MAP_ALIAS_SIZE_BITS == 0, "map alias size out of range");
        let w2 = pack(
            MapAliasWord2::ATTRIBUTE.val(attribute as u32)
                + MapAliasWord2::ADDRESS_HIGH.val((address >> 36) as u32)
                + MapAliasWord2::SIZE_HIGH.val((size >> 32) as u32)
                + MapAliasWord2::ADDRESS_MID.val(((address >> 32) & 0xF) as u32),
        );
        Self { words: [size as u32, address as u32, w2] }
    }

    #[inline]
    #[must_use]
    pub const fn from_words(words: [u32; 3]) -> Self {
        Self { words }
    }

    #[inline]
    #[must_use]
    pub const fn words(&self) -> [u32; 3] {
        self.words
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        let high = unpack(self.words[2], MapAliasWord2::ADDRESS_HIGH);
        let mid = unpack(self.words[2], MapAliasWord2::ADDRESS_MID);
        (u64::from((high << 4) | mid) << 32) | u64::from(self.words[1])
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        (u64::from(unpack(self.words[2], MapAliasWord2::SIZE_HIGH)) << 32)
            | u64::from(self.words[0])
    }

    /// Attribute, or `None` for the unassigned encoding 2.
    #[must_use]
    pub fn attribute(&self) -> Option<MapAliasAttribute> {
        MapAliasAttribute::from_raw(unpack(self.words[2], MapAliasWord2::ATTRIBUTE))
    }
}

/// Pointer (static buffer) descriptor (2 words).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PointerDescriptor {
    words: [u32; 2],
}

impl PointerDescriptor {
    pub const WORDS: usize = 2;

    #[must_use]
    pub fn new(address: u64, size: usize, index: u32) -> Self {
        assert!(address >> DESCRIPTOR_ADDRESS_BITS == 0, "pointer address out of range");
        assert!(size <= 0xFFFF, "pointer size out of range");
        assert!(index <= COUNT_MAX, "pointer index out of range");
        let w0 = pack(
            PointerWord0::INDEX.val(index)
                + PointerWord0::ADDRESS_HIGH.val((address >> 36) as u32)
                + PointerWord0::ADDRESS_MID.val(((address >> 32) & 0xF) as u32)
                + PointerWord0::SIZE.val(size as u32),
        );
        Self { words: [w0, address as u32] }
    }

    #[inline]
    #[must_use]
    pub const fn from_words(words: [u32; 2]) -> Self {
        Self { words }
    }

    #[inline]
    #[must_use]
    pub const fn words(&self) -> [u32; 2] {
        self.words
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        unpack(self.words[0], PointerWord0::INDEX)
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        let high = unpack(self.words[0], PointerWord0::ADDRESS_HIGH);
        let mid = unpack(self.words[0], PointerWord0::ADDRESS_MID);
        (u64::from((high << 4) | mid) << 32) | u64::from(self.words[1])
    }

    #[must_use]
    pub fn size(&self) -> usize {
        unpack(self.words[0], PointerWord0::SIZE) as usize
    }
}

/// Receive buffer offered for incoming pointer data (2 words).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ReceiveListEntry {
    words: [u32; 2],
}

impl ReceiveListEntry {
    pub const WORDS: usize = 2;

    #[must_use]
    pub fn new(address: u64, size: usize) -> Self {
        assert!(address >> DESCRIPTOR_ADDRESS_BITS == 0, "receive list address out of range");
        assert!(size <= 0xFFFF, "receive list size out of range");
        let w1 = pack(
            ReceiveListWord1::ADDRESS_HIGH.val((address >> 32) as u32)
                + ReceiveListWord1::SIZE.val(size as u32),
        );
        Self { words: [address as u32, w1] }
    }

    #[inline]
    #[must_use]
    pub const fn from_words(words: [u32; 2]) -> Self {
        Self { words }
    }

    #[inline]
    #[must_use]
    pub const fn words(&self) -> [u32; 2] {
        self.words
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        (u64::from(unpack(self.words[1], ReceiveListWord1::ADDRESS_HIGH)) << 32)
            | u64::from(self.words[0])
    }

    #[must_use]
    pub fn size(&self) -> usize {
        unpack(self.words[1], ReceiveListWord1::SIZE) as usize
    }
}

// -- Index chain

/// Word index of the process id / handle area.
#[must_use]
pub fn special_data_index(_hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    MessageHeader::WORDS + spc.header_size() / 4
}

/// Word index of the first copy handle.
#[must_use]
pub fn copy_handle_index(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    special_data_index(hdr, spc) + if spc.has_process_id() { 2 } else { 0 }
}

/// Word index of the first move handle.
#[must_use]
pub fn move_handle_index(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    copy_handle_index(hdr, spc) + spc.copy_handle_count() as usize
}

/// Word index of the first pointer descriptor.
#[must_use]
pub fn pointer_descriptor_index(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    special_data_index(hdr, spc) + spc.data_size() / 4
}

/// Word index of the first map-alias descriptor.
#[must_use]
pub fn map_alias_descriptor_index(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    pointer_descriptor_index(hdr, spc) + PointerDescriptor::WORDS * hdr.pointer_count() as usize
}

/// Word index of the first raw data word.
#[must_use]
pub fn raw_data_index(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    map_alias_descriptor_index(hdr, spc)
        + MapAliasDescriptor::WORDS * hdr.map_alias_count() as usize
}

/// Word index of the receive list.
#[must_use]
pub fn receive_list_index(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    match hdr.receive_list_offset() {
        0 => raw_data_index(hdr, spc) + hdr.raw_count() as usize,
        offset => offset as usize,
    }
}

/// Total number of bytes the message described by `hdr` and `spc` occupies.
#[must_use]
pub fn message_buffer_size(hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
    receive_list_index(hdr, spc) * 4 + hdr.receive_list_count().footprint()
}

/// Largest size any header can describe.
pub const MAX_MESSAGE_SIZE: usize = {
    let counts = COUNT_MAX as usize;
    let special = 1 + 2 + 2 * counts;
    let pointers = PointerDescriptor::WORDS * counts;
    let map_aliases = MapAliasDescriptor::WORDS * 3 * counts;
    let derived = MessageHeader::WORDS + special + pointers + map_aliases + RAW_COUNT_MAX as usize;
    let explicit = RECEIVE_LIST_OFFSET_MAX as usize;
    let index = if derived > explicit { derived } else { explicit };
    index * 4 + RECEIVE_LIST_COUNT_MAX as usize * ReceiveListEntry::WORDS * 4
};

const _: () = assert!(MAX_MESSAGE_SIZE == 8292);
const _: () = assert!(MESSAGE_BUFFER_SIZE < MAX_MESSAGE_SIZE);

// -- Buffer view

/// Mutable view of a message buffer.
pub struct MessageBuffer<'a> {
    words: &'a mut [u32],
}

impl<'a> MessageBuffer<'a> {
    #[must_use]
    pub fn new(words: &'a mut [u32]) -> Self {
        Self { words }
    }

    /// View a byte buffer as message words.
    ///
    /// Fails with `InvalidSize` if the length is not a multiple of four and
    /// with `InvalidPointer` if the buffer is not word aligned.
    pub fn from_bytes(bytes: &'a mut [u8]) -> SvcResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(SvcError::InvalidSize);
        }
        let words = <[u32]>::mut_from_bytes(bytes).map_err(|_| SvcError::InvalidPointer)?;
        Ok(Self { words })
    }

    /// Capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len() * 4
    }

    /// Validate a header against this buffer before marshalling.
    ///
    /// Returns the message size in bytes.
    pub fn check_fits(&self, hdr: &MessageHeader, spc: &SpecialHeader) -> SvcResult<usize> {
        let size = message_buffer_size(hdr, spc);
        if size > self.capacity() {
            return Err(SvcError::MessageTooLarge);
        }
        Ok(size)
    }

    #[track_caller]
    fn check_index(&self, index: usize, count: usize) {
        assert!(
            index.checked_add(count).is_some_and(|end| end <= self.words.len()),
            "message buffer index out of range"
        );
    }

    // -- Writers

    /// Zero the header; the buffer then carries no message.
    pub fn set_null(&mut self) {
        self.set_header(&MessageHeader::NULL);
    }

    pub fn set_header(&mut self, hdr: &MessageHeader) -> usize {
        self.set_raw(0, &hdr.words)
    }

    /// Write the special header word. Returns the index of the first data word.
    pub fn set_special_header(&mut self, hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
        if spc.is_present() {
            self.set_word(MessageHeader::WORDS, spc.word);
        }
        special_data_index(hdr, spc)
    }

    pub fn set_process_id(&mut self, index: usize, pid: u64) -> usize {
        self.set_raw(index, &[pid as u32, (pid >> 32) as u32])
    }

    pub fn set_handle(&mut self, index: usize, handle: Handle) -> usize {
        self.set_word(index, handle.raw())
    }

    pub fn set_pointer(&mut self, index: usize, desc: &PointerDescriptor) -> usize {
        self.set_raw(index, &desc.words)
    }

    pub fn set_map_alias(&mut self, index: usize, desc: &MapAliasDescriptor) -> usize {
        self.set_raw(index, &desc.words)
    }

    pub fn set_receive_list_entry(&mut self, index: usize, entry: &ReceiveListEntry) -> usize {
        self.set_raw(index, &entry.words)
    }

    #[track_caller]
    pub fn set_word(&mut self, index: usize, value: u32) -> usize {
        self.set_raw(index, &[value])
    }

    /// Copy `data` to `index`. Returns the index following the copied words.
    #[track_caller]
    pub fn set_raw(&mut self, index: usize, data: &[u32]) -> usize {
        self.check_index(index, data.len());
        self.words[index..index + data.len()].copy_from_slice(data);
        index + data.len()
    }

    /// Write an asynchronous result: a null header followed by the code.
    pub fn set_async_result(&mut self, code: ResultCode) {
        self.set_null();
        self.set_word(MessageHeader::WORDS, code.raw());
    }

    // -- Readers

    #[must_use]
    pub fn header(&self) -> MessageHeader {
        self.check_index(0, MessageHeader::WORDS);
        MessageHeader::from_words(self.words[0], self.words[1])
    }

    #[must_use]
    pub fn special_header(&self, hdr: &MessageHeader) -> SpecialHeader {
        if !hdr.has_special_header() {
            return SpecialHeader::ABSENT;
        }
        SpecialHeader::from_word(self.get_word(MessageHeader::WORDS), true)
    }

    #[must_use]
    pub fn get_process_id(&self, index: usize) -> u64 {
        let [lo, hi] = self.get_array::<2>(index);
        u64::from(lo) | (u64::from(hi) << 32)
    }

    #[must_use]
    pub fn get_handle(&self, index: usize) -> Handle {
        Handle::from_raw(self.get_word(index))
    }

    #[must_use]
    pub fn get_pointer(&self, index: usize) -> PointerDescriptor {
        PointerDescriptor::from_words(self.get_array(index))
    }

    #[must_use]
    pub fn get_map_alias(&self, index: usize) -> MapAliasDescriptor {
        MapAliasDescriptor::from_words(self.get_array(index))
    }

    #[must_use]
    pub fn get_receive_list_entry(&self, index: usize) -> ReceiveListEntry {
        ReceiveListEntry::from_words(self.get_array(index))
    }

    #[track_caller]
    #[must_use]
    pub fn get_word(&self, index: usize) -> u32 {
        self.check_index(index, 1);
        self.words[index]
    }

    #[track_caller]
    fn get_array<const N: usize>(&self, index: usize) -> [u32; N] {
        self.check_index(index, N);
        let mut out = [0u32; N];
        out.copy_from_slice(&self.words[index..index + N]);
        out
    }

    /// Result of an asynchronous operation.
    ///
    /// A non-null header means a real reply landed in the buffer, which
    /// counts as success.
    #[must_use]
    pub fn get_async_result(&self) -> ResultCode {
        if !self.header().is_null() {
            return ResultCode::SUCCESS;
        }
        ResultCode::from_raw(self.get_word(MessageHeader::WORDS))
    }
}

impl fmt::Debug for MessageBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("MessageBuffer");
        s.field("capacity", &self.capacity());
        if self.words.len() >= MessageHeader::WORDS {
            s.field("header", &self.header());
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let hdr = MessageHeader::new(0x1234, true, 1, 2, 3, 4, 5, ReceiveListCountType::Entries(3));
        let [w0, w1] = hdr.words();
        assert_eq!(w0, 0x1234 | (1 << 16) | (2 << 20) | (3 << 24) | (4 << 28));
        assert_eq!(w1, 5 | (5 << 10) | (1 << 31));
        assert_eq!(hdr.tag(), 0x1234);
        assert_eq!(hdr.map_alias_count(), 9);
        assert_eq!(hdr.receive_list_count(), ReceiveListCountType::Entries(3));
        assert!(hdr.has_special_header());
    }

    #[test]
    fn test_header_setters() {
        let mut hdr = MessageHeader::new(7, false, 0, 0, 0, 0, 4, ReceiveListCountType::None);
        hdr.set_receive_list_count(ReceiveListCountType::ToSingleBuffer);
        hdr.set_receive_list_offset(0x40);
        assert_eq!(hdr.receive_list_count(), ReceiveListCountType::ToSingleBuffer);
        assert_eq!(hdr.receive_list_offset(), 0x40);
        assert_eq!(hdr.raw_count(), 4);
        assert_eq!(hdr.tag(), 7);
    }

    #[test]
    #[should_panic(expected = "raw count out of range")]
    fn test_header_raw_overflow() {
        let _ = MessageHeader::new(0, false, 0, 0, 0, 0, 1024, ReceiveListCountType::None);
    }

    #[test]
    fn test_special_header_sizes() {
        let spc = SpecialHeader::new(true, 2, 1);
        assert_eq!(spc.word(), 1 | (2 << 1) | (1 << 5));
        assert_eq!(spc.header_size(), 4);
        assert_eq!(spc.data_size(), 8 + 12);
        assert_eq!(SpecialHeader::ABSENT.header_size(), 0);
        assert_eq!(SpecialHeader::ABSENT.data_size(), 0);
    }

    #[test]
    fn test_descriptor_addresses() {
        let addr = 0x7F_8765_4321;
        let alias = MapAliasDescriptor::new(addr, 0xA_1234_5678, MapAliasAttribute::NonDeviceIpc);
        assert_eq!(alias.address(), addr);
        assert_eq!(alias.size(), 0xA_1234_5678);
        assert_eq!(alias.attribute(), Some(MapAliasAttribute::NonDeviceIpc));
        assert_eq!(alias.words()[2] >> 28, 0xF);
        assert_eq!((alias.words()[2] >> 2) & 0x7, 0x7);

        let ptr = PointerDescriptor::new(addr, 0x800, 3);
        assert_eq!(ptr.address(), addr);
        assert_eq!(ptr.size(), 0x800);
        assert_eq!(ptr.index(), 3);

        let entry = ReceiveListEntry::new(addr, 0x100);
        assert_eq!(entry.address(), addr);
        assert_eq!(entry.size(), 0x100);
        assert_eq!(entry.words()[1] & 0x7F, 0x7F);
    }

    #[test]
    fn test_reserved_attribute_encoding() {
        let alias = MapAliasDescriptor::from_words([0, 0, 2]);
        assert_eq!(alias.attribute(), None);
    }

    #[test]
    fn test_index_chain() {
        let hdr = MessageHeader::new(1, true, 2, 1, 0, 1, 3, ReceiveListCountType::Entries(2));
        let spc = SpecialHeader::new(true, 1, 2);
        assert_eq!(special_data_index(&hdr, &spc), 3);
        assert_eq!(copy_handle_index(&hdr, &spc), 5);
        assert_eq!(move_handle_index(&hdr, &spc), 6);
        assert_eq!(pointer_descriptor_index(&hdr, &spc), 8);
        assert_eq!(map_alias_descriptor_index(&hdr, &spc), 12);
        assert_eq!(raw_data_index(&hdr, &spc), 18);
        assert_eq!(receive_list_index(&hdr, &spc), 21);
        assert_eq!(message_buffer_size(&hdr, &spc), 21 * 4 + 16);
    }

    #[test]
    fn test_receive_list_footprints() {
        let size = |count| {
            let hdr = MessageHeader::new(0, false, 0, 0, 0, 0, 1, count);
            message_buffer_size(&hdr, &SpecialHeader::ABSENT)
        };
        assert_eq!(size(ReceiveListCountType::None), 12);
        assert_eq!(size(ReceiveListCountType::ToMessageBuffer), 12);
        assert_eq!(size(ReceiveListCountType::ToSingleBuffer), 20);
        assert_eq!(size(ReceiveListCountType::Entries(13)), 12 + 13 * 8);
    }

    #[test]
    fn test_explicit_receive_list_offset() {
        let mut hdr = MessageHeader::new(0, false, 0, 0, 0, 0, 2, ReceiveListCountType::ToSingleBuffer);
        hdr.set_receive_list_offset(0x20);
        assert_eq!(receive_list_index(&hdr, &SpecialHeader::ABSENT), 0x20);
        assert_eq!(message_buffer_size(&hdr, &SpecialHeader::ABSENT), 0x80 + 8);
    }

    #[test]
    fn test_marshal_and_read_back() {
        let mut words = [0u32; MESSAGE_BUFFER_WORDS];
        let mut buf = MessageBuffer::new(&mut words);
        let hdr = MessageHeader::new(0x10, true, 1, 1, 0, 0, 2, ReceiveListCountType::ToSingleBuffer);
        let spc = SpecialHeader::new(true, 1, 0);
        assert_eq!(buf.check_fits(&hdr, &spc), Ok(message_buffer_size(&hdr, &spc)));

        buf.set_header(&hdr);
        let mut i = buf.set_special_header(&hdr, &spc);
        i = buf.set_process_id(i, 0x1_0000_0042);
        i = buf.set_handle(i, Handle::new(3, 9));
        assert_eq!(i, pointer_descriptor_index(&hdr, &spc));
        i = buf.set_pointer(i, &PointerDescriptor::new(0x1000, 0x40, 0));
        i = buf.set_map_alias(i, &MapAliasDescriptor::new(0x2000, 0x1000, MapAliasAttribute::Ipc));
        assert_eq!(i, raw_data_index(&hdr, &spc));
        i = buf.set_word(i, 0xDEAD);
        i = buf.set_word(i, 0xBEEF);
        assert_eq!(i, receive_list_index(&hdr, &spc));
        buf.set_receive_list_entry(i, &ReceiveListEntry::new(0x3000, 0x80));

        let got = buf.header();
        assert_eq!(got, hdr);
        let got_spc = buf.special_header(&got);
        assert_eq!(got_spc, spc);
        assert_eq!(buf.get_process_id(special_data_index(&got, &got_spc)), 0x1_0000_0042);
        assert_eq!(buf.get_handle(copy_handle_index(&got, &got_spc)), Handle::new(3, 9));
        assert_eq!(buf.get_pointer(pointer_descriptor_index(&got, &got_spc)).address(), 0x1000);
        assert_eq!(buf.get_map_alias(map_alias_descriptor_index(&got, &got_spc)).size(), 0x1000);
        assert_eq!(buf.get_word(raw_data_index(&got, &got_spc) + 1), 0xBEEF);
        assert_eq!(buf.get_receive_list_entry(receive_list_index(&got, &got_spc)).size(), 0x80);
    }

    #[test]
    fn test_async_result() {
        let mut words = [0u32; 4];
        let mut buf = MessageBuffer::new(&mut words);
        buf.set_async_result(ResultCode::from(SvcError::SessionClosed));
        assert_eq!(buf.get_async_result(), ResultCode::from(SvcError::SessionClosed));

        let hdr = MessageHeader::new(1, false, 0, 0, 0, 0, 0, ReceiveListCountType::None);
        buf.set_header(&hdr);
        assert!(buf.get_async_result().is_success());
    }

    #[test]
    fn test_too_large_rejected() {
        let mut words = [0u32; MESSAGE_BUFFER_WORDS];
        let buf = MessageBuffer::new(&mut words);
        let hdr = MessageHeader::new(0, false, 0, 0, 0, 0, 63, ReceiveListCountType::None);
        assert_eq!(buf.check_fits(&hdr, &SpecialHeader::ABSENT), Err(SvcError::MessageTooLarge));
        let hdr = MessageHeader::new(0, false, 0, 0, 0, 0, 62, ReceiveListCountType::None);
        assert_eq!(buf.check_fits(&hdr, &SpecialHeader::ABSENT), Ok(MESSAGE_BUFFER_SIZE));
    }

    #[test]
    #[should_panic(expected = "message buffer index out of range")]
    fn test_write_past_end_panics() {
        let mut words = [0u32; 4];
        let mut buf = MessageBuffer::new(&mut words);
        buf.set_pointer(3, &PointerDescriptor::default());
    }

    #[test]
    fn test_from_bytes() {
        let mut words = [0u32; 4];
        let bytes = zerocopy::IntoBytes::as_mut_bytes(&mut words[..]);
        let buf = MessageBuffer::from_bytes(bytes).map(|b| b.capacity());
        assert_eq!(buf, Ok(16));

        let mut words = [0u32; 4];
        let bytes = zerocopy::IntoBytes::as_mut_bytes(&mut words[..]);
        assert_eq!(MessageBuffer::from_bytes(&mut bytes[..7]).err(), Some(SvcError::InvalidSize));
        assert_eq!(MessageBuffer::from_bytes(&mut bytes[1..9]).err(), Some(SvcError::InvalidPointer));
    }

    fn arb_header() -> impl Strategy<Value = (MessageHeader, SpecialHeader)> {
        (
            (any::<u16>(), 0u32..=15, 0u32..=15, 0u32..=15, 0u32..=15),
            (0u32..=1023, 0u32..=15, prop_oneof![Just(0u32), 0u32..=2047]),
            proptest::option::of((any::<bool>(), 0u32..=15, 0u32..=15)),
        )
            .prop_map(|((tag, p, s, r, x), (raw, rl, off), special)| {
                let spc = match special {
                    Some((pid, c, m)) => SpecialHeader::new(pid, c, m),
                    None => SpecialHeader::ABSENT,
                };
                let mut hdr = MessageHeader::new(
                    tag,
                    spc.is_present(),
                    p,
                    s,
                    r,
                    x,
                    raw,
                    ReceiveListCountType::from_raw(rl),
                );
                hdr.set_receive_list_offset(off);
                (hdr, spc)
            })
    }

    /// Take up to `want` items of `words` words each from `left`.
    fn take(left: &mut usize, want: u32, words: usize) -> u32 {
        let n = want.min((*left / words) as u32);
        *left -= n as usize * words;
        n
    }

    /// Headers whose message fits the per-thread buffer: a word budget is
    /// drawn first and then handed out field by field.
    fn arb_fitting_message() -> impl Strategy<Value = (MessageHeader, SpecialHeader)> {
        (
            MessageHeader::WORDS..=MESSAGE_BUFFER_WORDS,
            any::<u16>(),
            proptest::option::of((any::<bool>(), 0u32..=15, 0u32..=15)),
            (0u32..=15, 0u32..=15, 0u32..=15, 0u32..=15),
            (0u32..=15, 0u32..=MESSAGE_BUFFER_WORDS as u32),
        )
            .prop_map(|(budget, tag, special, (p, s, r, x), (rl, raw))| {
                let mut left = budget - MessageHeader::WORDS;
                let spc = match special {
                    Some((pid, c, m)) if left >= 1 => {
                        left -= 1;
                        let pid = take(&mut left, u32::from(pid), 2) == 1;
                        let c = take(&mut left, c, 1);
                        let m = take(&mut left, m, 1);
                        SpecialHeader::new(pid, c, m)
                    }
                    _ => SpecialHeader::ABSENT,
                };
                let p = take(&mut left, p, PointerDescriptor::WORDS);
                let s = take(&mut left, s, MapAliasDescriptor::WORDS);
                let r = take(&mut left, r, MapAliasDescriptor::WORDS);
                let x = take(&mut left, x, MapAliasDescriptor::WORDS);

                let mut list = ReceiveListCountType::from_raw(rl);
                if list.entry_count() * ReceiveListEntry::WORDS > left {
                    list = ReceiveListCountType::None;
                }
                left -= list.entry_count() * ReceiveListEntry::WORDS;
                let raw = take(&mut left, raw, 1);

                let hdr = MessageHeader::new(tag, spc.is_present(), p, s, r, x, raw, list);
                (hdr, spc)
            })
    }

    fn message_pid(hdr: &MessageHeader) -> u64 {
        0x1_0000_0000 | u64::from(hdr.tag())
    }

    fn copy_handle(n: usize) -> Handle {
        Handle::new(n as u16 + 1, n as u16 + 1)
    }

    fn move_handle(n: usize) -> Handle {
        Handle::new(n as u16 + 0x100, 0x7FFF - n as u16)
    }

    fn pointer(n: usize) -> PointerDescriptor {
        let address = ((n as u64 % 8) << 36) | ((n as u64 % 16) << 32) | (0x1000 * (n as u64 + 1));
        PointerDescriptor::new(address, 0x10 * (n + 1), n as u32)
    }

    fn map_alias(n: usize) -> MapAliasDescriptor {
        let attributes = [MapAliasAttribute::Ipc, MapAliasAttribute::NonSecureIpc, MapAliasAttribute::NonDeviceIpc];
        let address = ((n as u64 % 8) << 36) | ((15 - n as u64 % 16) << 32) | (0x2000 * (n as u64 + 1));
        let size = ((n as u64 % 16) << 32) | 0x1000;
        MapAliasDescriptor::new(address, size, attributes[n % 3])
    }

    fn raw_word(n: usize) -> u32 {
        0xA5A5_0000 | n as u32
    }

    fn receive_entry(n: usize) -> ReceiveListEntry {
        ReceiveListEntry::new(((n as u64 % 128) << 32) | 0x3000, 0x20 * (n + 1))
    }

    /// Write every part of the message `hdr` and `spc` describe. Returns the
    /// word index just past the receive list.
    fn write_message(buf: &mut MessageBuffer<'_>, hdr: &MessageHeader, spc: &SpecialHeader) -> usize {
        buf.set_header(hdr);
        let mut i = buf.set_special_header(hdr, spc);
        if spc.has_process_id() {
            i = buf.set_process_id(i, message_pid(hdr));
        }
        for n in 0..spc.copy_handle_count() as usize {
            i = buf.set_handle(i, copy_handle(n));
        }
        for n in 0..spc.move_handle_count() as usize {
            i = buf.set_handle(i, move_handle(n));
        }
        for n in 0..hdr.pointer_count() as usize {
            i = buf.set_pointer(i, &pointer(n));
        }
        for n in 0..hdr.map_alias_count() as usize {
            i = buf.set_map_alias(i, &map_alias(n));
        }
        for n in 0..hdr.raw_count() as usize {
            i = buf.set_word(i, raw_word(n));
        }
        for n in 0..hdr.receive_list_count().entry_count() {
            i = buf.set_receive_list_entry(i, &receive_entry(n));
        }
        i
    }

    /// Header describing the largest possible message.
    fn largest_message() -> (MessageHeader, SpecialHeader) {
        let spc = SpecialHeader::new(true, 15, 15);
        let mut hdr = MessageHeader::new(u16::MAX, true, 15, 15, 15, 15, RAW_COUNT_MAX, ReceiveListCountType::from_raw(15));
        hdr.set_receive_list_offset(RECEIVE_LIST_OFFSET_MAX);
        (hdr, spc)
    }

    #[test]
    fn test_largest_message_fits_exactly() {
        let (hdr, spc) = largest_message();
        assert_eq!(message_buffer_size(&hdr, &spc), MAX_MESSAGE_SIZE);

        let mut words = vec![0u32; MAX_MESSAGE_SIZE / 4];
        let buf = MessageBuffer::new(&mut words);
        assert_eq!(buf.check_fits(&hdr, &spc), Ok(MAX_MESSAGE_SIZE));

        let mut words = vec![0u32; MAX_MESSAGE_SIZE / 4 - 1];
        let buf = MessageBuffer::new(&mut words);
        assert_eq!(buf.check_fits(&hdr, &spc), Err(SvcError::MessageTooLarge));
    }

    #[test]
    fn test_full_buffer_round_trip() {
        let spc = SpecialHeader::new(true, 2, 1);
        let hdr = MessageHeader::new(0x42, true, 3, 1, 1, 1, 0, ReceiveListCountType::Entries(4));
        let fixed = message_buffer_size(&hdr, &spc) / 4;
        let hdr = MessageHeader::new(
            0x42,
            true,
            3,
            1,
            1,
            1,
            (MESSAGE_BUFFER_WORDS - fixed) as u32,
            ReceiveListCountType::Entries(4),
        );
        assert_eq!(message_buffer_size(&hdr, &spc), MESSAGE_BUFFER_SIZE);

        let mut words = [0u32; MESSAGE_BUFFER_WORDS];
        let mut buf = MessageBuffer::new(&mut words);
        assert_eq!(buf.check_fits(&hdr, &spc), Ok(MESSAGE_BUFFER_SIZE));
        assert_eq!(write_message(&mut buf, &hdr, &spc), MESSAGE_BUFFER_WORDS);
        assert_eq!(buf.header(), hdr);
        assert_eq!(buf.get_handle(move_handle_index(&hdr, &spc)), move_handle(0));
        assert_eq!(buf.get_word(receive_list_index(&hdr, &spc) - 1), raw_word(hdr.raw_count() as usize - 1));

        let over = MessageHeader::new(
            0x42,
            true,
            3,
            1,
            1,
            1,
            hdr.raw_count() + 1,
            ReceiveListCountType::Entries(4),
        );
        assert_eq!(buf.check_fits(&over, &spc), Err(SvcError::MessageTooLarge));
    }

    proptest! {
        #[test]
        fn prop_size_bounded((hdr, spc) in arb_header()) {
            prop_assert!(message_buffer_size(&hdr, &spc) <= MAX_MESSAGE_SIZE);
        }

        #[test]
        fn prop_check_fits_exact((hdr, spc) in arb_header()) {
            let mut words = [0u32; MESSAGE_BUFFER_WORDS];
            let buf = MessageBuffer::new(&mut words);
            let size = message_buffer_size(&hdr, &spc);
            match buf.check_fits(&hdr, &spc) {
                Ok(n) => {
                    prop_assert_eq!(n, size);
                    prop_assert!(size <= MESSAGE_BUFFER_SIZE);
                }
                Err(e) => {
                    prop_assert_eq!(e, SvcError::MessageTooLarge);
                    prop_assert!(size > MESSAGE_BUFFER_SIZE);
                }
            }
        }

        #[test]
        fn prop_fitting_messages_round_trip((hdr, spc) in arb_fitting_message()) {
            let mut words = [0u32; MESSAGE_BUFFER_WORDS];
            let mut buf = MessageBuffer::new(&mut words);
            let size = message_buffer_size(&hdr, &spc);
            prop_assert_eq!(buf.check_fits(&hdr, &spc), Ok(size));

            let end = write_message(&mut buf, &hdr, &spc);
            prop_assert_eq!(end * 4, size);

            let got = buf.header();
            prop_assert_eq!(got, hdr);
            let got_spc = buf.special_header(&got);
            prop_assert_eq!(got_spc, spc);

            if got_spc.has_process_id() {
                prop_assert_eq!(buf.get_process_id(special_data_index(&got, &got_spc)), message_pid(&got));
            }
            let copies = copy_handle_index(&got, &got_spc);
            for n in 0..got_spc.copy_handle_count() as usize {
                prop_assert_eq!(buf.get_handle(copies + n), copy_handle(n));
            }
            let moves = move_handle_index(&got, &got_spc);
            for n in 0..got_spc.move_handle_count() as usize {
                prop_assert_eq!(buf.get_handle(moves + n), move_handle(n));
            }

            let pointers = pointer_descriptor_index(&got, &got_spc);
            for n in 0..got.pointer_count() as usize {
                let desc = buf.get_pointer(pointers + n * PointerDescriptor::WORDS);
                let want = pointer(n);
                prop_assert_eq!(desc, want);
                prop_assert_eq!(desc.index(), want.index());
                prop_assert_eq!(desc.address(), want.address());
                prop_assert_eq!(desc.size(), want.size());
            }

            let aliases = map_alias_descriptor_index(&got, &got_spc);
            for n in 0..got.map_alias_count() as usize {
                let desc = buf.get_map_alias(aliases + n * MapAliasDescriptor::WORDS);
                let want = map_alias(n);
                prop_assert_eq!(desc.address(), want.address());
                prop_assert_eq!(desc.size(), want.size());
                prop_assert_eq!(desc.attribute(), want.attribute());
            }

            let raw = raw_data_index(&got, &got_spc);
            for n in 0..got.raw_count() as usize {
                prop_assert_eq!(buf.get_word(raw + n), raw_word(n));
            }

            let list = receive_list_index(&got, &got_spc);
            for n in 0..got.receive_list_count().entry_count() {
                let entry = buf.get_receive_list_entry(list + n * ReceiveListEntry::WORDS);
                prop_assert_eq!(entry.address(), receive_entry(n).address());
                prop_assert_eq!(entry.size(), receive_entry(n).size());
            }
        }
    }
}
