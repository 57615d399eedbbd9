// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::BufMut;

use super::{TransactionId, TxJournal, XaTxJournal, take_array, take_slice};
use crate::{
    Result,
    error::XaSnafu,
    xa::{XaErrorCode, XaFlags, Xid},
};

impl TransactionId for Xid {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_i32_le(self.format_id);
        for part in [&self.global_transaction_id, &self.branch_qualifier] {
            // XA caps both parts at 64 bytes; `XaResource::start` enforces it.
            buf.put_u8(u8::try_from(part.len()).unwrap_or(u8::MAX));
            buf.put_slice(part);
        }
    }

    fn decode_from(buf: &mut &[u8]) -> Option<Self> {
        let format_id = i32::from_le_bytes(take_array(buf)?);
        let [gtrid_len] = take_array::<1>(buf)?;
        let gtrid = take_slice(buf, usize::from(gtrid_len))?.to_vec();
        let [bqual_len] = take_array::<1>(buf)?;
        let bqual = take_slice(buf, usize::from(bqual_len))?.to_vec();
        Some(Self::new(format_id, gtrid, bqual))
    }
}

impl XaTxJournal {
    /// Xids that journaled a prepare marker and no terminal marker.
    pub fn prepared_transactions(&self) -> Vec<Xid> {
        self.open_transactions()
            .into_iter()
            .filter(|open| open.is_prepared())
            .map(|open| open.tx)
            .collect()
    }

    /// Recovery scan over prepared branches.
    ///
    /// `START_RSCAN` opens a scan and returns every prepared Xid; further
    /// calls inside the scan return nothing new. `END_RSCAN` closes it.
    /// Calling without `START_RSCAN` outside a scan is a protocol error.
    pub fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>> {
        let starting = flags.contains(XaFlags::START_RSCAN);
        let ending = flags.contains(XaFlags::END_RSCAN);
        let xids = if starting { self.prepared_transactions() } else { Vec::new() };

        let mut state = self.state.lock();
        if !starting && !state.recovery_scan {
            return XaSnafu {
                code:    XaErrorCode::Inval,
                message: "recover called without an open scan",
            }
            .fail();
        }
        state.recovery_scan = !ending;
        Ok(xids)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::journal::TransactionJournal;

    fn xid(n: u8) -> Xid { Xid::new(1, vec![n; 4], vec![0xB0, n]) }

    #[test]
    fn test_xid_encoding() {
        let original = xid(7);
        let mut buf = Vec::new();
        original.encode_into(&mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(Xid::decode_from(&mut slice), Some(original));
        assert!(slice.is_empty());
    }

    #[test]
    fn test_recover_scan() {
        let temp_dir = TempDir::new().unwrap();
        let journal: XaTxJournal = TransactionJournal::open(temp_dir.path().join("tx.log"), u64::MAX).unwrap();

        journal.log_add(&xid(1), "q", 0, Bytes::from_static(b"a")).unwrap();
        journal.log_prepare(&xid(1)).unwrap();
        journal.log_add(&xid(2), "q", 1, Bytes::from_static(b"b")).unwrap();

        assert!(journal.recover(XaFlags::NO_FLAGS).is_err());

        let found = journal.recover(XaFlags::START_RSCAN).unwrap();
        assert_eq!(found, vec![xid(1)]);
        assert!(journal.recover(XaFlags::NO_FLAGS).unwrap().is_empty());
        assert!(journal.recover(XaFlags::END_RSCAN).unwrap().is_empty());
        assert!(journal.recover(XaFlags::NO_FLAGS).is_err());

        let both = journal.recover(XaFlags::START_RSCAN | XaFlags::END_RSCAN).unwrap();
        assert_eq!(both, vec![xid(1)]);
    }
}
