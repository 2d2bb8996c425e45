//! Wire framing and the slave-side reassembly buffer.
//!
//! Master -> slave frames are `[8-byte BE phy_offset][4-byte BE body_len][body]`.
//! Slave -> master reports are a bare 8-byte BE offset. Tokio's
//! `AsyncReadExt`/`AsyncWriteExt` integer helpers already use big-endian
//! ("network byte order"), so the framing code below never has to swap
//! bytes by hand.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// `8 (phy_offset) + 4 (body_len)`.
pub const FRAME_HEADER_LEN: usize = 12;
/// Size of a bare slave -> master offset report.
pub const OFFSET_REPORT_LEN: usize = 8;

/// Write one `[phy_offset][body_len][body]` frame.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    phy_offset: i64,
    body: &[u8],
) -> std::io::Result<()> {
    w.write_i64(phy_offset).await?;
    w.write_u32(body.len() as u32).await?;
    w.write_all(body).await?;
    Ok(())
}

/// Send an offset report (heartbeat or advance notification).
pub async fn write_offset_report<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    offset: i64,
) -> std::io::Result<()> {
    w.write_i64(offset).await
}

/// Read one offset report.
pub async fn read_offset_report<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> std::io::Result<i64> {
    r.read_i64().await
}

/// A frame successfully reassembled from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub phy_offset: i64,
    pub body: Vec<u8>,
}

/// The slave-side double-buffer used to reassemble frames out of a raw
/// byte stream that may split a frame across arbitrarily many reads.
///
/// `buffer_read` accumulates bytes written by the socket; `dispatch_position`
/// tracks how much of it has already been turned into [`Frame`]s. When
/// `buffer_read` has no remaining capacity, the unparsed tail is copied into
/// `buffer_backup` and the two buffers are swapped, exactly mirroring the
/// compaction scheme described for the replication protocol.
pub struct FrameAssembler {
    buffer_read: Vec<u8>,
    buffer_backup: Vec<u8>,
    write_pos: usize,
    dispatch_position: usize,
}

impl FrameAssembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer_read: vec![0u8; capacity],
            buffer_backup: vec![0u8; capacity],
            write_pos: 0,
            dispatch_position: 0,
        }
    }

    /// Bytes available to write into before the buffer needs compaction.
    pub fn remaining_capacity(&self) -> usize {
        self.buffer_read.len() - self.write_pos
    }

    /// The writable tail of `buffer_read`, for a socket read to fill.
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.buffer_read[self.write_pos..]
    }

    /// Record that `n` bytes were written into [`Self::write_slice`].
    pub fn advance_write(&mut self, n: usize) {
        self.write_pos += n;
    }

    /// If the buffer has no remaining capacity, compact: move the unparsed
    /// tail to the start of the (swapped-in) backup buffer.
    pub fn compact_if_full(&mut self) {
        if self.remaining_capacity() > 0 {
            return;
        }
        let tail_len = self.write_pos - self.dispatch_position;
        self.buffer_backup[..tail_len]
            .copy_from_slice(&self.buffer_read[self.dispatch_position..self.write_pos]);
        std::mem::swap(&mut self.buffer_read, &mut self.buffer_backup);
        self.write_pos = tail_len;
        self.dispatch_position = 0;
    }

    /// Pop one complete frame if enough bytes are buffered, without any
    /// divergence checking -- that is the caller's concern.
    pub fn try_take_frame(&mut self) -> Option<Frame> {
        let available = self.write_pos - self.dispatch_position;
        if available < FRAME_HEADER_LEN {
            return None;
        }
        let hdr =
            &self.buffer_read[self.dispatch_position..self.dispatch_position + FRAME_HEADER_LEN];
        let phy_offset = i64::from_be_bytes(hdr[0..8].try_into().unwrap());
        let body_len = u32::from_be_bytes(hdr[8..12].try_into().unwrap()) as usize;

        if available < FRAME_HEADER_LEN + body_len {
            return None;
        }
        let body_start = self.dispatch_position + FRAME_HEADER_LEN;
        let body = self.buffer_read[body_start..body_start + body_len].to_vec();
        self.dispatch_position = body_start + body_len;
        Some(Frame { phy_offset, body })
    }
}
