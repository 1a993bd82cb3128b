//! Block-at-a-time header/footer scanner with a carried tail.

use memchr::memmem;

use super::SignaturePair;

/// A header..footer span found by the scanner, inclusive of both markers.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Offset of the header from the first byte ever pushed.
    pub local_offset: u64,
    pub bytes: &'a [u8],
}

/// How scanning continues after a candidate has been handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The span is taken; resume after its footer.
    Consume,
    /// The span is not ours; resume right after its header so headers
    /// inside it are still seen.
    Skip,
}

/// Scans a byte stream pushed in blocks.
///
/// The last `tail_keep` bytes of every combined buffer are carried into the
/// next push, so a span that crosses a block boundary is still visible as
/// long as it fits in the carry. Nothing else crosses blocks: a header whose
/// footer is not in the current buffer is abandoned.
#[derive(Debug)]
pub struct BlockScanner {
    signature: SignaturePair,
    tail_keep: usize,
    carry: Vec<u8>,
    carry_pos: u64,
    resume_at: u64,
    consumed: u64,
}

impl BlockScanner {
    pub fn new(signature: SignaturePair, tail_keep: usize) -> Self {
        Self {
            signature,
            tail_keep,
            carry: Vec::new(),
            carry_pos: 0,
            resume_at: 0,
            consumed: 0,
        }
    }

    /// Total bytes pushed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Scan `block` (prefixed by the carried tail) and hand every new
    /// candidate to `on_candidate`, in increasing offset order.
    ///
    /// Spans already reported from the carried region are not reported again.
    pub fn push_block<E, F>(&mut self, block: &[u8], mut on_candidate: F) -> Result<(), E>
    where
        F: FnMut(Candidate<'_>) -> Result<Step, E>,
    {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(block);
        let buf_start = self.carry_pos;
        self.consumed += block.len() as u64;

        let header = self.signature.header();
        let footer = self.signature.footer();
        let header_finder = memmem::Finder::new(header);
        let footer_finder = memmem::Finder::new(footer);

        let mut resume_at = self.resume_at;
        let mut idx = (resume_at.saturating_sub(buf_start) as usize).min(buf.len());

        while idx < buf.len() {
            let Some(start) = header_finder.find(&buf[idx..]).map(|p| p + idx) else {
                break;
            };
            let body = start + header.len();
            let Some(end) = footer_finder
                .find(&buf[body..])
                .map(|p| body + p + footer.len())
            else {
                // No footer after this header means none after any later header
                // either, so the rest of the buffer has nothing to offer.
                break;
            };

            let step = on_candidate(Candidate {
                local_offset: buf_start + start as u64,
                bytes: &buf[start..end],
            })?;
            idx = match step {
                Step::Consume => end,
                Step::Skip => body,
            };
            resume_at = buf_start + idx as u64;
        }
        self.resume_at = resume_at;

        if buf.len() > self.tail_keep {
            let cut = buf.len() - self.tail_keep;
            buf.drain(..cut);
            self.carry_pos = buf_start + cut as u64;
        } else {
            self.carry_pos = buf_start;
        }
        self.carry = buf;
        Ok(())
    }
}
