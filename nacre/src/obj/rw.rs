// SPDX-License-Identifier: MPL-2.0

//! Byte-granularity object IO.
//!
//! These entry points drive the same populate path as a CPU fault, without
//! a real trap. Offsets are object-relative and shifted past the reserved
//! null page internally. Reads of unbacked pages observe zeros without
//! materializing them; writes force private (diverged) backing first.

use nstd::mm::page::Page;

use crate::{
    obj::{MapAttrs, Object, OpFlags},
    prelude::*,
    OBJ_MAXSIZE, OBJ_NULLPAGE_SIZE,
};

impl Object {
    /// Reads `buf.len()` bytes at byte offset `start`.
    pub fn read_data(&self, start: usize, buf: &mut [u8]) -> Result<()> {
        let start = Self::shifted_span(start, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let abs = start + done;
            let in_page = abs % PAGE_SIZE;
            let thislen = (PAGE_SIZE - in_page).min(buf.len() - done);
            let chunk = &mut buf[done..done + thislen];
            self.operate_on_locked_page(
                (abs / PAGE_SIZE) as u64,
                OpFlags::ZERO_OK,
                None,
                &mut |page: Option<&Page>, _attrs| {
                    match page {
                        Some(page) => page.read_bytes(in_page, chunk),
                        // Unbacked pages read as zeros.
                        None => chunk.fill(0),
                    }
                    Ok(())
                },
            )?;
            done += thislen;
        }
        Ok(())
    }

    /// Writes `buf` at byte offset `start`.
    pub fn write_data(&self, start: usize, buf: &[u8]) -> Result<()> {
        let start = Self::shifted_span(start, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let abs = start + done;
            let in_page = abs % PAGE_SIZE;
            let thislen = (PAGE_SIZE - in_page).min(buf.len() - done);
            let chunk = &buf[done..done + thislen];
            self.operate_on_locked_page(
                (abs / PAGE_SIZE) as u64,
                OpFlags::DO_COPY,
                None,
                &mut |page: Option<&Page>, _attrs| {
                    let page = page.expect("the write path always materializes a page");
                    page.write_bytes(in_page, chunk);
                    Ok(())
                },
            )?;
            done += thislen;
        }
        Ok(())
    }

    /// Stores `val` at byte offset `offset` as one 8-byte atomic write.
    /// The offset must be 8-byte aligned.
    pub fn write_data_atomic64(&self, offset: usize, val: u64) -> Result<()> {
        if offset % 8 != 0 {
            return Err(Error::InvalidArgs);
        }
        let offset = Self::shifted_span(offset, 8)?;
        let in_page = offset % PAGE_SIZE;
        self.operate_on_locked_page(
            (offset / PAGE_SIZE) as u64,
            OpFlags::DO_COPY,
            None,
            &mut |page: Option<&Page>, _attrs| {
                let page = page.expect("the write path always materializes a page");
                page.write_u64_atomic(in_page, val);
                Ok(())
            },
        )
    }

    /// Shifts a caller-relative span past the null page and bounds-checks
    /// it against the object slot size.
    fn shifted_span(start: usize, len: usize) -> Result<usize> {
        let start = start.checked_add(OBJ_NULLPAGE_SIZE).ok_or(Error::InvalidArgs)?;
        let end = start.checked_add(len).ok_or(Error::InvalidArgs)?;
        if start as u64 >= OBJ_MAXSIZE || end as u64 > OBJ_MAXSIZE {
            return Err(Error::InvalidArgs);
        }
        Ok(start)
    }
}
