//! The byte buffer pair: two growable byte arrays used alternately as
//! "active" and "next" read targets.
//!
//! The algorithm here is a direct port of
//! `NetworkStreamClient::Implementation::OnReadCompleted`'s buffer
//! bookkeeping (growth triggers (i)/(ii)/(iii), the ceiling check, and the
//! tail-copy-into-next-buffer dance), expressed over `Vec<u8>` instead of
//! raw pointers.

use crate::error::ClientError;

/// Default initial capacity in release builds: 2 MiB.
#[cfg(not(debug_assertions))]
pub const DEFAULT_INITIAL_CAPACITY: usize = 2 * 1024 * 1024;
/// Default initial capacity in debug builds: 256 B (keeps growth-path tests
/// fast without waiting to allocate megabytes).
#[cfg(debug_assertions)]
pub const DEFAULT_INITIAL_CAPACITY: usize = 256;

/// Hard ceiling on a buffer's capacity: 20 MiB.
pub const DEFAULT_MAX_CAPACITY: usize = 20 * 1024 * 1024;

/// One of the two buffers in a `BufferPair`.
#[derive(Debug)]
pub struct ByteBuffer {
    data: Vec<u8>,
    /// Length of the logical valid prefix; everything in
    /// `[0, offset)` is carried-over, already-matched message bytes.
    offset: usize,
}

impl ByteBuffer {
    fn with_capacity(capacity: usize) -> ByteBuffer {
        ByteBuffer {
            data: vec![0u8; capacity],
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        debug_assert!(offset <= self.data.len());
        self.offset = offset;
    }

    /// The full backing slice, including the unwritten tail.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The region into which the next read should be issued:
    /// `[offset, capacity)`.
    pub fn write_target(&mut self) -> &mut [u8] {
        let offset = self.offset;
        &mut self.data[offset..]
    }

    pub fn free_space(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Doubles this buffer's capacity, preserving its prefix bytes.
    fn double(&mut self) {
        let new_size = self.data.len() * 2;
        self.data.resize(new_size, 0);
    }

    /// Resets the write offset and zero-length backing store back to
    /// `capacity`, used when the active buffer is reclaimed as the future
    /// next buffer after a dispatch.
    fn reset_to(&mut self, capacity: usize) {
        self.offset = 0;
        self.data.clear();
        self.data.resize(capacity, 0);
    }

    /// Copies `src` into this buffer's prefix, growing first if there's no
    /// room (growth trigger (ii)).
    fn receive_tail(&mut self, src: &[u8]) {
        if src.len() > self.data.len() {
            self.data.resize(src.len(), 0);
        }
        self.data[..src.len()].copy_from_slice(src);
        self.offset = src.len();
    }
}

/// Outcome of one `BufferPair::on_read_completed` call: whether the
/// caller should dispatch the `[0, last_byte]` region of the (old) active
/// buffer to the decoder before it's possible to read again.
pub struct ReadOutcome {
    /// `Some(last_byte_exclusive_end)` when at least one complete message is
    /// present; `None` when the buffered region is a single, still-partial
    /// message.
    pub dispatch_upto: Option<usize>,
    /// Number of growth doublings performed servicing this read.
    pub growths: u32,
}

/// Two buffers, one active (current read target) and one next.
pub struct BufferPair {
    buffers: [ByteBuffer; 2],
    /// Index into `buffers` of the buffer currently armed for reading.
    active: usize,
    max_capacity: usize,
    received_bytes: u64,
}

impl BufferPair {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> BufferPair {
        BufferPair {
            buffers: [
                ByteBuffer::with_capacity(initial_capacity),
                ByteBuffer::with_capacity(initial_capacity),
            ],
            active: 0,
            max_capacity,
            received_bytes: 0,
        }
    }

    pub fn active(&self) -> &ByteBuffer {
        &self.buffers[self.active]
    }

    pub fn active_mut(&mut self) -> &mut ByteBuffer {
        &mut self.buffers[self.active]
    }

    fn next_index(&self) -> usize {
        1 - self.active
    }

    pub fn next(&self) -> &ByteBuffer {
        &self.buffers[self.next_index()]
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Applies the read-loop algorithm for one completed read of
    /// `transferred` bytes at `active.offset()`. Returns what the caller
    /// should dispatch to the decoder (if anything) and leaves the buffer
    /// pair positioned so `active()`/`active_mut()` is the buffer the next
    /// read should be armed against, at the correct offset.
    ///
    /// `find_last_byte` is given `(buffer_begin=0, transfer_begin, transfer_end)`
    /// offsets into the active buffer and must return the offset one past
    /// the last byte of the last complete message, or `transfer_end` if no
    /// complete message is present — matching the decoder contract exactly.
    pub fn on_read_completed<F>(
        &mut self,
        transferred: usize,
        find_last_byte: F,
        log_tag: &str,
    ) -> Result<ReadOutcome, ClientError>
    where
        F: FnOnce(usize, usize, usize) -> usize,
    {
        let mut growths = 0;

        // Reclaim the buffer retired by the *previous* call: it was left
        // at its old capacity so the caller could still read the dispatch
        // region out of it after that call returned. It's safe to resize
        // now, one read cycle later, since the caller has long since
        // dispatched those bytes before arming another read.
        let next_idx = self.next_index();
        let active_capacity = self.buffers[self.active].capacity();
        if self.buffers[next_idx].capacity() < active_capacity {
            self.buffers[next_idx].reset_to(active_capacity);
        }

        let active_idx = self.active;
        let transfer_begin = self.buffers[active_idx].offset();
        let transfer_end = transfer_begin + transferred;
        self.received_bytes += transferred as u64;

        let last_byte_end = find_last_byte(0, transfer_begin, transfer_end);
        debug_assert!(last_byte_end >= transfer_begin && last_byte_end <= transfer_end);

        let buffered_size = transfer_end; // == bufferStartOffset + transferredBytes
        let unreceived_len = if last_byte_end == transfer_end {
            buffered_size
        } else {
            transfer_end - last_byte_end
        };

        if unreceived_len > 0 && unreceived_len >= buffered_size {
            // The entire buffered region is one still-incomplete message.
            debug_assert_eq!(unreceived_len, buffered_size);
            let free_space = self.buffers[active_idx].capacity() - buffered_size;
            if unreceived_len / 3 > free_space {
                growths += self.grow_both(log_tag)?;
            }
            self.buffers[active_idx].set_offset(transfer_end);
            return Ok(ReadOutcome {
                dispatch_upto: None,
                growths,
            });
        }

        if unreceived_len > 0 {
            let free_space = self.buffers[active_idx].capacity() - buffered_size;
            if free_space == 0 {
                let doubled = self.buffers[active_idx].capacity() * 2;
                if doubled > self.max_capacity {
                    return Err(ClientError::Overflow {
                        attempted: doubled,
                        ceiling: self.max_capacity,
                    });
                }
                let next_idx = self.next_index();
                self.buffers[next_idx].reset_to(doubled);
                growths += 1;
                debug!(
                    "{}increasing buffer size: {:.02} -> {:.02} kilobytes",
                    log_tag,
                    (doubled / 2) as f64 / 1024.0,
                    doubled as f64 / 1024.0
                );
            }
            let tail_start = transfer_end - unreceived_len;
            let tail: Vec<u8> =
                self.buffers[active_idx].as_slice()[tail_start..transfer_end].to_vec();
            let next_idx = self.next_index();
            self.buffers[next_idx].receive_tail(&tail);
        } else {
            let next_idx = self.next_index();
            self.buffers[next_idx].set_offset(0);
        }

        // Roles swap: what was `next` becomes `active` for the following
        // read. The buffer being retired here (the old active) still holds
        // the dispatch region `[0, last_byte_end]` the caller is about to
        // read out and hand to the decoder — it's reclaimed lazily, at the
        // top of the *next* call, once that dispatch has happened.
        self.active = self.next_index();

        Ok(ReadOutcome {
            dispatch_upto: Some(last_byte_end),
            growths,
        })
    }

    /// Growth trigger (i): a single message is already as large as the
    /// entire buffered region. Doubles both buffers in lock-step, per the
    /// invariant that `next.capacity() >= active.capacity()` always holds.
    fn grow_both(&mut self, log_tag: &str) -> Result<u32, ClientError> {
        let current = self.buffers[self.active].capacity();
        let doubled = current * 2;
        if doubled > self.max_capacity {
            return Err(ClientError::Overflow {
                attempted: doubled,
                ceiling: self.max_capacity,
            });
        }
        warn!(
            "{}receiving large message; increasing buffer: {:.02} -> {:.02} kilobytes",
            log_tag,
            current as f64 / 1024.0,
            doubled as f64 / 1024.0
        );
        self.buffers[0].double();
        self.buffers[1].double();
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pair_starts_at_offset_zero() {
        let pair = BufferPair::new(64, 1024);
        assert_eq!(pair.active().offset(), 0);
        assert_eq!(pair.active().capacity(), 64);
        assert_eq!(pair.next().capacity(), 64);
    }

    #[test]
    fn clean_framed_delivery_dispatches_and_carries_tail() {
        // "ABC\r\nDEF\r\nGHI" — find_last_byte locates the end of "DEF\r\n".
        let mut pair = BufferPair::new(64, 1024);
        let msg = b"ABC\r\nDEF\r\nGHI";
        pair.active_mut().as_mut_slice()[..msg.len()].copy_from_slice(msg);
        let last_crlf_end = 10; // "ABC\r\nDEF\r\n".len()
        let outcome = pair
            .on_read_completed(msg.len(), |_b, _from, _to| last_crlf_end, "")
            .unwrap();
        assert_eq!(outcome.dispatch_upto, Some(last_crlf_end));
        assert_eq!(outcome.growths, 0);
        // "GHI" (3 bytes) was carried into the new active buffer's prefix.
        assert_eq!(pair.active().offset(), 3);
        assert_eq!(&pair.active().as_slice()[..3], b"GHI");
        // The dispatch region the caller still needs to hand to the decoder
        // lives in the retired buffer, untouched by the swap.
        assert_eq!(&pair.next().as_slice()[..outcome.dispatch_upto.unwrap()], b"ABC\r\nDEF\r\n");
    }

    #[test]
    fn retired_buffer_is_reclaimed_only_on_the_following_call() {
        let mut pair = BufferPair::new(64, 1024);
        let msg = b"ABC\r\n";
        pair.active_mut().as_mut_slice()[..msg.len()].copy_from_slice(msg);
        let outcome = pair.on_read_completed(msg.len(), |_b, _from, _to| 5, "").unwrap();
        assert_eq!(outcome.dispatch_upto, Some(5));
        // Immediately after the call, the dispatch bytes are still intact.
        assert_eq!(&pair.next().as_slice()[..5], b"ABC\r\n");

        // A subsequent read dispatches out of the other buffer; the first
        // one isn't touched until it's cycled back in as a write target.
        let msg2 = b"DEF\r\n";
        pair.active_mut().as_mut_slice()[..msg2.len()].copy_from_slice(msg2);
        let _ = pair.on_read_completed(msg2.len(), |_b, _from, _to| 5, "").unwrap();
        assert_eq!(&pair.next().as_slice()[..5], b"DEF\r\n");
    }

    #[test]
    fn no_boundary_found_keeps_accumulating_same_buffer() {
        let mut pair = BufferPair::new(64, 1024);
        let msg = b"no-terminator-here-yet";
        pair.active_mut().as_mut_slice()[..msg.len()].copy_from_slice(msg);
        let outcome = pair
            .on_read_completed(msg.len(), |_b, _from, to| to, "")
            .unwrap();
        assert_eq!(outcome.dispatch_upto, None);
        assert_eq!(pair.active().offset(), msg.len());
    }

    #[test]
    fn ceiling_breach_is_fatal() {
        let mut pair = BufferPair::new(256, 256);
        let msg = vec![b'x'; 256];
        pair.active_mut().as_mut_slice()[..256].copy_from_slice(&msg);
        let err = pair
            .on_read_completed(256, |_b, _from, to| to, "")
            .unwrap_err();
        match err {
            ClientError::Overflow { ceiling, .. } => assert_eq!(ceiling, 256),
            other => panic!("expected Overflow, got {:?}", other),
        }
    }

    #[test]
    fn oversized_message_doubles_until_boundary_found() {
        // Initial capacity 256B; decoder reports no boundary until we've
        // accumulated 400 bytes total across two reads.
        let mut pair = BufferPair::new(256, 1024 * 1024);
        let first = vec![b'a'; 256];
        pair.active_mut().as_mut_slice()[..256].copy_from_slice(&first);
        let outcome = pair
            .on_read_completed(256, |_b, _from, to| to, "")
            .unwrap();
        assert_eq!(outcome.dispatch_upto, None);
        assert!(pair.active().capacity() >= 512);

        let second_len = 400 - 256;
        {
            let s = pair.active_mut();
            let off = s.offset();
            s.as_mut_slice()[off..off + second_len].copy_from_slice(&vec![b'b'; second_len]);
        }
        let boundary = 400;
        let outcome = pair
            .on_read_completed(second_len, |_b, _from, _to| boundary, "")
            .unwrap();
        assert_eq!(outcome.dispatch_upto, Some(400));
        assert_eq!(pair.next().capacity(), pair.active().capacity());
    }
}
