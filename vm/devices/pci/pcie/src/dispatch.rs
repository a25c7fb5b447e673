// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Inbound TLP handling: completions for outstanding requests, and
//! memory and I/O requests from downstream bus masters that target root
//! complex owned regions.

use crate::root::RootComplex;
use crate::tlp::Tlp;
use crate::tlp::TlpError;
use crate::tlp::TlpType;
use std::ops::Range;
use thiserror::Error;

/// Errors handling an inbound TLP.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The root complex does not accept requests of this kind.
    #[error("no handler for inbound {0:?} requests")]
    Unhandled(TlpType),
    /// The packet failed validation.
    #[error("malformed inbound tlp")]
    Malformed(#[from] TlpError),
}

/// Splits the bytes enabled by `first_be` / `last_be` over `dw_len` dwords
/// into contiguous runs of byte offsets.
pub(crate) fn byte_enable_runs(first_be: u8, last_be: u8, dw_len: usize) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for i in 0..dw_len * 4 {
        let dw = i / 4;
        let be = if dw == 0 {
            first_be
        } else if dw == dw_len - 1 {
            last_be
        } else {
            0xf
        };
        let enabled = (be >> (i % 4)) & 1 != 0;
        match (enabled, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..dw_len * 4);
    }
    runs
}

impl RootComplex {
    /// Handles a TLP arriving from below the root complex.
    pub async fn downstream_recv(&self, tlp: Tlp) -> Result<(), DispatchError> {
        tracing::debug!(
            fmt_type = ?tlp.fmt_type,
            requester = %tlp.requester_id,
            tag = tlp.tag,
            "inbound tlp"
        );
        if let Err(err) = tlp.validate() {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                fmt_type = ?tlp.fmt_type,
                "dropping malformed inbound tlp"
            );
            return Err(err.into());
        }

        match tlp.fmt_type {
            TlpType::Cpl | TlpType::CplData | TlpType::CplLocked | TlpType::CplLockedData => {
                self.completions.route(tlp);
                Ok(())
            }
            TlpType::IoRead => {
                self.handle_io_read(tlp).await;
                Ok(())
            }
            TlpType::IoWrite => {
                self.handle_io_write(tlp).await;
                Ok(())
            }
            TlpType::MemRead | TlpType::MemRead64 => {
                self.handle_mem_read(tlp).await;
                Ok(())
            }
            TlpType::MemWrite | TlpType::MemWrite64 => {
                self.handle_mem_write(tlp).await;
                Ok(())
            }
            TlpType::MemReadLocked
            | TlpType::MemReadLocked64
            | TlpType::CfgRead0
            | TlpType::CfgWrite0
            | TlpType::CfgRead1
            | TlpType::CfgWrite1 => Err(DispatchError::Unhandled(tlp.fmt_type)),
        }
    }

    async fn send_ur(&self, req: &Tlp) {
        self.send(Tlp::ur_completion_for(req, self.config.requester_id))
            .await;
    }

    async fn handle_io_read(&self, tlp: Tlp) {
        let region = self.io_regions.lock().find(tlp.address);
        let Some(region) = region else {
            tracing::warn!(
                address = tlp.address,
                requester = %tlp.requester_id,
                "io read request did not match any region"
            );
            self.send_ur(&tlp).await;
            return;
        };

        let mut data = [0; 4];
        for run in byte_enable_runs(tlp.first_be, tlp.last_be, 1) {
            let addr = tlp.address + run.start as u64;
            if let Err(err) = region.read(addr, &mut data[run]).await {
                tracing::warn!(error = &err as &dyn std::error::Error, "io read failed");
                self.send_ur(&tlp).await;
                return;
            }
        }

        let mut cpl = Tlp::completion_data_for(&tlp, self.config.requester_id);
        cpl.set_data(&data);
        cpl.byte_count = 4;
        self.send(cpl).await;
    }

    async fn handle_io_write(&self, tlp: Tlp) {
        let region = self.io_regions.lock().find(tlp.address);
        let Some(region) = region else {
            tracing::warn!(
                address = tlp.address,
                requester = %tlp.requester_id,
                "io write request did not match any region"
            );
            self.send_ur(&tlp).await;
            return;
        };

        let data = tlp.data_bytes();
        for run in byte_enable_runs(tlp.first_be, tlp.last_be, 1) {
            let addr = tlp.address + run.start as u64;
            if let Err(err) = region.write(addr, &data[run]).await {
                tracing::warn!(error = &err as &dyn std::error::Error, "io write failed");
                self.send_ur(&tlp).await;
                return;
            }
        }

        self.send(Tlp::completion_for(&tlp, self.config.requester_id))
            .await;
    }

    async fn handle_mem_read(&self, tlp: Tlp) {
        if tlp.crosses_page() {
            tracing::warn!(
                address = tlp.address,
                length = tlp.length,
                requester = %tlp.requester_id,
                "memory read request crosses a 4k boundary"
            );
            self.send_ur(&tlp).await;
            return;
        }

        let region = self.mem_regions.lock().find(tlp.address);
        let Some(region) = region else {
            tracing::warn!(
                address = tlp.address,
                requester = %tlp.requester_id,
                "memory read request did not match any region"
            );
            self.send_ur(&tlp).await;
            return;
        };

        let dw_length = tlp.length as usize;
        let mut data = vec![0; dw_length * 4];
        if let Err(err) = region.read(tlp.address, &mut data).await {
            tracing::warn!(error = &err as &dyn std::error::Error, "memory read failed");
            self.send_ur(&tlp).await;
            return;
        }
        tracing::debug!(address = tlp.address, dw_length, "serving memory read");

        let max_payload_dw = 32usize << self.config.max_payload_size;
        let rcb_mask = (self.config.read_completion_boundary as u64 - 1) & 0x7c;
        let byte_length = tlp.be_byte_count();
        let mut addr = tlp.address + tlp.first_be_offset() as u64;
        let mut m = 0;
        let mut n = 0;
        while m < dw_length {
            let mut cpl_dw = dw_length - m;
            let byte_count = byte_length - n;
            if cpl_dw > max_payload_dw {
                // end the completion on a read completion boundary
                cpl_dw = max_payload_dw - ((addr & rcb_mask) >> 2) as usize;
            }

            let mut cpl = Tlp::completion_data_for(&tlp, self.config.requester_id);
            cpl.lower_address = (addr & 0x7f) as u8;
            cpl.byte_count = byte_count as u16;
            cpl.set_data(&data[m * 4..(m + cpl_dw) * 4]);
            self.send(cpl).await;

            let consumed = cpl_dw * 4 - (addr & 3) as usize;
            m += cpl_dw;
            n += consumed;
            addr += consumed as u64;
        }
    }

    async fn handle_mem_write(&self, tlp: Tlp) {
        if tlp.crosses_page() {
            tracing::warn!(
                address = tlp.address,
                length = tlp.length,
                requester = %tlp.requester_id,
                "dropping memory write that crosses a 4k boundary"
            );
            return;
        }

        let region = self.mem_regions.lock().find(tlp.address);
        let Some(region) = region else {
            tracing::warn!(
                address = tlp.address,
                requester = %tlp.requester_id,
                "dropping memory write that did not match any region"
            );
            return;
        };

        let data = tlp.data_bytes();
        for run in byte_enable_runs(tlp.first_be, tlp.last_be, tlp.length as usize) {
            let addr = tlp.address + run.start as u64;
            if let Err(err) = region.write(addr, &data[run]).await {
                tracing::warn!(error = &err as &dyn std::error::Error, "memory write failed");
                return;
            }
        }
    }
}
