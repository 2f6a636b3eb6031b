//! Array transfer between ranks
//!
//! An [`ArrayHeader`] always goes first. In copy mode it is followed by one
//! raw frame on [`ARRAY_PAYLOAD_TAG`] holding the array bytes; in shared mode
//! the header alone locates the bytes inside a shared segment.

use cohort_ipc::{Rank, ARRAY_PAYLOAD_TAG};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::array::{ArrayData, DType, SharedArrayHandle};
use crate::error::{CoordinationError, CoordinationResult};
use crate::message::Message;
use crate::messenger::Messenger;

/// How the bytes of a transferred array reach the receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferMode {
    Copy,
    Shared(SharedArrayHandle),
}

/// Envelope describing an array in transit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayHeader {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub mode: TransferMode,
}

impl Message for ArrayHeader {
    const KIND: &'static str = "array_header";
}

/// Send `array` to `destination`, by handle when `shared` is given
pub async fn send_array(
    messenger: &Messenger,
    array: &ArrayData,
    destination: Rank,
    shared: Option<SharedArrayHandle>,
) -> CoordinationResult<()> {
    let header = ArrayHeader {
        shape: array.shape().to_vec(),
        dtype: array.dtype(),
        mode: match shared {
            Some(handle) => TransferMode::Shared(handle),
            None => TransferMode::Copy,
        },
    };
    messenger.send(&header, destination).await?;

    if header.mode == TransferMode::Copy {
        trace!(
            "Copying {} bytes of array to rank {}",
            array.bytes().len(),
            destination
        );
        messenger
            .send_raw(array.bytes().clone(), destination, ARRAY_PAYLOAD_TAG)
            .await?;
    }
    Ok(())
}

/// Receive an array from `source`, whichever mode it was sent in
pub async fn receive_array(messenger: &Messenger, source: Rank) -> CoordinationResult<ArrayData> {
    let (header, _) = messenger.receive::<ArrayHeader>(Some(source)).await?;
    match header.mode {
        TransferMode::Copy => {
            let frame = messenger.receive_raw(source, ARRAY_PAYLOAD_TAG).await?;
            ArrayData::new(header.shape, header.dtype, frame.payload)
        }
        TransferMode::Shared(handle) => {
            let segment = messenger
                .transport()
                .shared_segments()
                .and_then(|segments| segments.get(&handle.segment))
                .ok_or_else(|| CoordinationError::SegmentUnavailable {
                    name: handle.segment.clone(),
                })?;
            let end = handle.offset + handle.byte_len();
            if end > segment.len() {
                return Err(CoordinationError::InvalidArray(format!(
                    "handle reaches byte {} of segment {} holding {}",
                    end,
                    handle.segment,
                    segment.len()
                )));
            }
            ArrayData::new(header.shape, header.dtype, segment.slice(handle.offset..end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRegistry;
    use cohort_ipc::LocalTransport;
    use std::sync::Arc;

    fn pair() -> (Messenger, Messenger) {
        let registry = Arc::new(MessageRegistry::new());
        let mut group = LocalTransport::group(2).into_iter();
        let zero = group.next().unwrap();
        let one = group.next().unwrap();
        (
            Messenger::new(Arc::new(zero), Arc::clone(&registry)),
            Messenger::new(Arc::new(one), registry),
        )
    }

    #[tokio::test]
    async fn test_copy_transfer() {
        let (sender, receiver) = pair();
        let array = ArrayData::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();

        send_array(&sender, &array, 1, None).await.unwrap();
        let received = receive_array(&receiver, 0).await.unwrap();
        assert_eq!(received, array);
    }

    #[tokio::test]
    async fn test_shared_transfer_reads_segment() {
        let (sender, receiver) = pair();
        let array = ArrayData::from_i64(vec![4], &[10, 20, 30, 40]).unwrap();
        let segments = sender.transport().shared_segments().unwrap();
        segments.publish("cohort:snap:mass", array.bytes().clone());

        let rows = array.slice_rows(1..3).unwrap();
        let handle = SharedArrayHandle {
            segment: "cohort:snap:mass".to_string(),
            shape: rows.shape().to_vec(),
            dtype: rows.dtype(),
            offset: 8,
        };
        send_array(&sender, &rows, 1, Some(handle)).await.unwrap();

        let received = receive_array(&receiver, 0).await.unwrap();
        assert_eq!(received.to_i64_vec().unwrap(), vec![20, 30]);
        assert_eq!(received.bytes().as_ptr(), array.bytes()[8..].as_ptr());
    }

    #[tokio::test]
    async fn test_missing_segment() {
        let (sender, receiver) = pair();
        let array = ArrayData::from_u8(vec![1], &[7]).unwrap();
        let handle = SharedArrayHandle {
            segment: "gone".to_string(),
            shape: vec![1],
            dtype: DType::U8,
            offset: 0,
        };
        send_array(&sender, &array, 1, Some(handle)).await.unwrap();
        assert!(matches!(
            receive_array(&receiver, 0).await,
            Err(CoordinationError::SegmentUnavailable { .. })
        ));
    }
}
