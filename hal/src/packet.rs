//! # Command / Response Packets
//!
//! Fixed-size word-array packets exchanged with the compute engine, plus the
//! static registry describing each command type: where its buffer-descriptor
//! table sits inside the payload and which completion signal (if any) the
//! sender must await.
//!
//! The payload encodings beyond the two header words are opaque to the
//! driver; only the declared buffer descriptors are interpreted, and then
//! rewritten in place with resolved device addresses before submission.

use static_assertions::const_assert;

/// Command packet payload size in 32-bit words
pub const PKT_SIZE_WORDS: usize = 64;

/// Response packet payload size in 32-bit words
pub const MSG_SIZE_WORDS: usize = 32;

/// Words occupied by one buffer descriptor (handle, size)
pub const BUF_DESC_WORDS: usize = 2;

/// Maximum (input + output) fence pairs carried by a fence command
pub const FENCE_PAIRS_MAX: usize = 8;

const_assert!(MSG_SIZE_WORDS <= PKT_SIZE_WORDS);

// =============================================================================
// Packet Kinds
// =============================================================================

/// Establish the session's persistent engine-side buffers
pub const PKT_SET_PERSISTENT: u32 = 0x0801;
/// Configure the depth-estimation pipeline
pub const PKT_DEPTH_CONFIG: u32 = 0x0802;
/// Submit one depth-estimation frame
pub const PKT_DEPTH_FRAME: u32 = 0x0803;
/// Configure the motion-estimation pipeline
pub const PKT_MOTION_CONFIG: u32 = 0x0804;
/// Submit one motion-estimation frame
pub const PKT_MOTION_FRAME: u32 = 0x0805;

// =============================================================================
// Completion Signals
// =============================================================================

/// Named completion signals the engine raises per command family.
///
/// Each session keeps one receipt slot per signal; a command whose
/// [`PacketInfo`] names a signal blocks until the engine acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Persistent buffers accepted
    SetPersistent,
    /// Depth pipeline configured
    DepthConfigDone,
    /// Motion pipeline configured
    MotionConfigDone,
    /// Motion frame completed
    MotionFrameDone,
}

/// Number of distinct completion signals
pub const SIGNAL_COUNT: usize = 4;

impl Signal {
    /// Dense index for the per-session receipt table
    pub fn index(self) -> usize {
        match self {
            Signal::SetPersistent => 0,
            Signal::DepthConfigDone => 1,
            Signal::MotionConfigDone => 2,
            Signal::MotionFrameDone => 3,
        }
    }
}

// =============================================================================
// Packet Registry
// =============================================================================

/// Static description of one command type
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    /// Command type word
    pub kind: u32,
    /// Word offset of the buffer-descriptor table, zero if none
    pub buf_offset: usize,
    /// Number of declared buffer descriptors
    pub buf_count: usize,
    /// Completion signal to await after submission, if any
    pub signal: Option<Signal>,
}

/// Registry of all known command types.
///
/// Frame submissions complete asynchronously through the session queue, so
/// they carry no signal; configuration and persistent-buffer commands are
/// acknowledged by name. Motion frames are the exception: the engine
/// requires the sender to hold until the frame is retired.
pub static PACKET_TABLE: &[PacketInfo] = &[
    PacketInfo {
        kind: PKT_SET_PERSISTENT,
        buf_offset: 4,
        buf_count: 2,
        signal: Some(Signal::SetPersistent),
    },
    PacketInfo {
        kind: PKT_DEPTH_CONFIG,
        buf_offset: 0,
        buf_count: 0,
        signal: Some(Signal::DepthConfigDone),
    },
    PacketInfo {
        kind: PKT_DEPTH_FRAME,
        buf_offset: 8,
        buf_count: 4,
        signal: None,
    },
    PacketInfo {
        kind: PKT_MOTION_CONFIG,
        buf_offset: 0,
        buf_count: 0,
        signal: Some(Signal::MotionConfigDone),
    },
    PacketInfo {
        kind: PKT_MOTION_FRAME,
        buf_offset: 8,
        buf_count: 6,
        signal: Some(Signal::MotionFrameDone),
    },
];

// Largest declared buffer table must fit inside the payload.
const_assert!(8 + 6 * BUF_DESC_WORDS <= PKT_SIZE_WORDS);

/// Look up the registry entry for a command type
pub fn packet_info(kind: u32) -> Option<&'static PacketInfo> {
    PACKET_TABLE.iter().find(|info| info.kind == kind)
}

// =============================================================================
// Command Packet
// =============================================================================

/// One buffer descriptor inside a command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufDesc {
    /// External handle before resolution, device address after
    pub handle: u32,
    /// Buffer size in bytes
    pub size: u32,
}

/// One command packet: a fixed array of payload words.
///
/// Word 0 holds the total size in bytes, word 1 the command type; the rest
/// is command-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdPacket {
    /// Raw payload words
    pub words: [u32; PKT_SIZE_WORDS],
}

impl CmdPacket {
    /// Build an empty packet of the given command type
    pub fn new(kind: u32) -> Self {
        let mut words = [0u32; PKT_SIZE_WORDS];
        words[0] = (PKT_SIZE_WORDS * 4) as u32;
        words[1] = kind;
        CmdPacket { words }
    }

    /// Declared total size in bytes
    pub fn size_bytes(&self) -> u32 {
        self.words[0]
    }

    /// Command type word
    pub fn kind(&self) -> u32 {
        self.words[1]
    }

    /// Whether a descriptor table with `count` entries at `offset` words
    /// lies inside the payload
    pub fn table_in_bounds(offset: usize, count: usize) -> bool {
        offset >= 2 && offset + count * BUF_DESC_WORDS <= PKT_SIZE_WORDS
    }

    /// Read descriptor `i` of the table at word `offset`
    pub fn buf_desc(&self, offset: usize, i: usize) -> BufDesc {
        let at = offset + i * BUF_DESC_WORDS;
        BufDesc {
            handle: self.words[at],
            size: self.words[at + 1],
        }
    }

    /// Overwrite descriptor `i` of the table at word `offset`
    pub fn set_buf_desc(&mut self, offset: usize, i: usize, desc: BufDesc) {
        let at = offset + i * BUF_DESC_WORDS;
        self.words[at] = desc.handle;
        self.words[at + 1] = desc.size;
    }
}

// =============================================================================
// Response Packet
// =============================================================================

/// One asynchronous response packet from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgPacket {
    /// Raw payload words
    pub words: [u32; MSG_SIZE_WORDS],
}

impl MsgPacket {
    /// Build an empty response of the given type
    pub fn new(kind: u32) -> Self {
        let mut words = [0u32; MSG_SIZE_WORDS];
        words[0] = (MSG_SIZE_WORDS * 4) as u32;
        words[1] = kind;
        MsgPacket { words }
    }

    /// Response type word
    pub fn kind(&self) -> u32 {
        self.words[1]
    }
}

impl Default for MsgPacket {
    fn default() -> Self {
        MsgPacket {
            words: [0u32; MSG_SIZE_WORDS],
        }
    }
}

// =============================================================================
// Fence Command Packet
// =============================================================================

/// A command packet plus its fence-data block.
///
/// The block carries explicit input and output counts followed by
/// `(id, key)` import pairs: inputs first, outputs after. An input pair
/// with a zero id is absent and is skipped by the submission worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceCmdPacket {
    /// The embedded command packet
    pub pkt: CmdPacket,
    /// Fence block: `[in_count, out_count, id0, key0, id1, key1, ...]`
    pub fence_words: [u32; 2 + FENCE_PAIRS_MAX * 2],
}

impl FenceCmdPacket {
    /// Wrap a command packet with an empty fence block
    pub fn new(pkt: CmdPacket) -> Self {
        FenceCmdPacket {
            pkt,
            fence_words: [0u32; 2 + FENCE_PAIRS_MAX * 2],
        }
    }

    /// Number of declared input fence pairs
    pub fn input_count(&self) -> usize {
        self.fence_words[0] as usize
    }

    /// Number of declared output fence pairs
    pub fn output_count(&self) -> usize {
        self.fence_words[1] as usize
    }

    /// Whether the declared counts fit the block
    pub fn counts_in_bounds(&self) -> bool {
        self.input_count() + self.output_count() <= FENCE_PAIRS_MAX
    }

    /// Read pair `i` (inputs first, then outputs)
    pub fn pair(&self, i: usize) -> (u32, u32) {
        let at = 2 + i * 2;
        (self.fence_words[at], self.fence_words[at + 1])
    }

    /// Declare the input/output split
    pub fn set_counts(&mut self, inputs: usize, outputs: usize) {
        self.fence_words[0] = inputs as u32;
        self.fence_words[1] = outputs as u32;
    }

    /// Write pair `i` (inputs first, then outputs)
    pub fn set_pair(&mut self, i: usize, id: u32, key: u32) {
        let at = 2 + i * 2;
        self.fence_words[at] = id;
        self.fence_words[at + 1] = key;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_all_kinds() {
        for info in PACKET_TABLE {
            assert!(CmdPacket::table_in_bounds(info.buf_offset, info.buf_count) || info.buf_count == 0);
            assert!(packet_info(info.kind).is_some());
        }
        assert!(packet_info(0xdead_beef).is_none());
    }

    #[test]
    fn signal_indices_are_dense() {
        let signals = [
            Signal::SetPersistent,
            Signal::DepthConfigDone,
            Signal::MotionConfigDone,
            Signal::MotionFrameDone,
        ];
        for (i, sig) in signals.iter().enumerate() {
            assert_eq!(sig.index(), i);
        }
        assert_eq!(signals.len(), SIGNAL_COUNT);
    }

    #[test]
    fn buf_desc_roundtrip() {
        let mut pkt = CmdPacket::new(PKT_DEPTH_FRAME);
        let info = packet_info(PKT_DEPTH_FRAME).unwrap();
        let desc = BufDesc {
            handle: 42,
            size: 4096,
        };
        pkt.set_buf_desc(info.buf_offset, 2, desc);
        assert_eq!(pkt.buf_desc(info.buf_offset, 2), desc);
        assert_eq!(pkt.kind(), PKT_DEPTH_FRAME);
        assert_eq!(pkt.size_bytes(), (PKT_SIZE_WORDS * 4) as u32);
    }

    #[test]
    fn fence_block_roundtrip() {
        let mut fpkt = FenceCmdPacket::new(CmdPacket::new(PKT_MOTION_FRAME));
        fpkt.set_counts(2, 1);
        fpkt.set_pair(0, 0x0001_0004, 7);
        fpkt.set_pair(1, 0, 0);
        fpkt.set_pair(2, 0x0001_0005, 9);
        assert_eq!(fpkt.input_count(), 2);
        assert_eq!(fpkt.output_count(), 1);
        assert!(fpkt.counts_in_bounds());
        assert_eq!(fpkt.pair(0), (0x0001_0004, 7));
        assert_eq!(fpkt.pair(2), (0x0001_0005, 9));
    }
}
