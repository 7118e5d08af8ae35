//! Stream pump: frame a sequence of records onto a sink, and parse frames
//! back out of an incrementally-growing buffer as bytes arrive.
//!
//! Built against the `Stream`-of-`Bytes` shape both `reqwest`
//! request/response bodies and `hyper` bodies actually present in this
//! stack use, rather than an `AsyncRead`/`AsyncWrite` pair, which neither
//! client nor server body type here is. Frame payloads are already-encoded
//! bytes; the actual request/response record encode/decode happens one
//! layer up, at the
//! [`crate::registry`] erasure boundary.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};

use crate::cancel::CancelToken;
use crate::deadline::Deadline;
use crate::frame::{self, FrameHeader, HEADER_SIZE};
use crate::registry::BoxStream;
use crate::status::{StatusCode, TempoError};

async fn race_optional<F, T>(
    work: F,
    deadline: Option<&Deadline>,
    cancel: Option<&CancelToken>,
) -> Result<T, TempoError>
where
    F: std::future::Future<Output = Result<T, TempoError>>,
{
    match deadline {
        Some(d) => d.race(work, cancel).await,
        None => match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    r = work => r,
                    _ = token.cancelled() => Err(TempoError::new(StatusCode::Aborted, "call aborted")),
                }
            }
            None => work.await,
        },
    }
}

enum WriteState {
    Pumping(BoxStream<Result<Vec<u8>, TempoError>>, u32),
    Done,
}

/// Turn a record-payload stream into the wire byte stream `reqwest::Body`
/// / `hyper`'s `StreamBody` expect: each payload becomes `header || bytes`,
/// and exhaustion produces the terminal `length=0, flags=END_STREAM` frame
/// (§4.2). Each pull from `source` is raced against `deadline`/`cancel`.
pub fn write_frames(
    source: BoxStream<Result<Vec<u8>, TempoError>>,
    deadline: Option<Deadline>,
    cancel: Option<CancelToken>,
) -> BoxStream<Result<Bytes, TempoError>> {
    let stream_id = FrameHeader::random_stream_id();
    let state = (WriteState::Pumping(source, stream_id), deadline, cancel);

    Box::pin(stream::unfold(state, |(st, deadline, cancel)| async move {
        let WriteState::Pumping(mut source, stream_id) = st else {
            return None;
        };

        let next = race_optional(
            async { Ok(source.next().await) },
            deadline.as_ref(),
            cancel.as_ref(),
        )
        .await;

        match next {
            Err(e) => Some((Err(e), (WriteState::Done, deadline, cancel))),
            Ok(Some(Err(e))) => Some((Err(e), (WriteState::Done, deadline, cancel))),
            Ok(Some(Ok(payload))) => {
                let header = FrameHeader::new(payload.len() as u32, 0, stream_id);
                match frame::encode_header(&header) {
                    Ok(h) => {
                        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
                        buf.extend_from_slice(&h);
                        buf.extend_from_slice(&payload);
                        Some((
                            Ok(buf.freeze()),
                            (WriteState::Pumping(source, stream_id), deadline, cancel),
                        ))
                    }
                    Err(e) => Some((Err(e), (WriteState::Done, deadline, cancel))),
                }
            }
            Ok(None) => {
                let end = frame::end_stream_header(stream_id);
                match frame::encode_header(&end) {
                    Ok(h) => Some((
                        Ok(Bytes::copy_from_slice(&h)),
                        (WriteState::Done, deadline, cancel),
                    )),
                    Err(e) => Some((Err(e), (WriteState::Done, deadline, cancel))),
                }
            }
        }
    }))
}

struct ReadState {
    source: BoxStream<Result<Bytes, TempoError>>,
    buf: BytesMut,
    stream_ended: bool,
    deadline: Option<Deadline>,
    cancel: Option<CancelToken>,
}

async fn fill_buf(state: &mut ReadState, need: usize) -> Result<(), TempoError> {
    while state.buf.len() < need {
        let next = race_optional(
            async { Ok(state.source.next().await) },
            state.deadline.as_ref(),
            state.cancel.as_ref(),
        )
        .await?;
        match next {
            Some(Ok(bytes)) => state.buf.extend_from_slice(&bytes),
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(())
}

/// Tolerate a legacy transport adapter inserting `\r\n` after a payload
/// (§9, open question on CRLF normativity — this implementation never
/// writes one, but accepts one on read).
async fn skip_tolerated_crlf(state: &mut ReadState) -> Result<(), TempoError> {
    fill_buf(state, 2).await?;
    if state.buf.len() >= 2 && &state.buf[0..2] == b"\r\n" {
        let _ = state.buf.split_to(2);
    }
    Ok(())
}

/// A lazy, finite, cancellable sequence of frame payloads parsed out of
/// `source` (§4.2, §9 "async generators"). Yields one `Vec<u8>` per data
/// frame; heartbeat frames (`length=0`, not `END_STREAM`) are consumed
/// silently. Terminates cleanly on an `END_STREAM` frame; yields a single
/// `DATA_LOSS` error if the source ends mid-frame.
pub fn read_frames(
    source: BoxStream<Result<Bytes, TempoError>>,
    deadline: Option<Deadline>,
    cancel: Option<CancelToken>,
) -> BoxStream<Result<Vec<u8>, TempoError>> {
    let state = ReadState {
        source,
        buf: BytesMut::new(),
        stream_ended: false,
        deadline,
        cancel,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.stream_ended {
            return None;
        }

        loop {
            if let Err(e) = fill_buf(&mut state, HEADER_SIZE).await {
                state.stream_ended = true;
                return Some((Err(e), state));
            }
            if state.buf.len() < HEADER_SIZE {
                let lost = state.buf.len();
                state.stream_ended = true;
                if lost == 0 {
                    return None;
                }
                return Some((
                    Err(TempoError::new(
                        StatusCode::DataLoss,
                        format!("{lost} lost bytes: connection closed mid-frame-header"),
                    )),
                    state,
                ));
            }

            let header_bytes = state.buf.split_to(HEADER_SIZE);
            let header = match frame::read_header(&header_bytes, 0) {
                Ok(h) => h,
                Err(e) => {
                    state.stream_ended = true;
                    return Some((Err(e), state));
                }
            };

            if header.is_end_stream() {
                state.stream_ended = true;
                return None;
            }

            if header.length == 0 {
                // Heartbeat: consumed, nothing to yield, keep reading.
                continue;
            }

            let want = header.length as usize;
            if let Err(e) = fill_buf(&mut state, want).await {
                state.stream_ended = true;
                return Some((Err(e), state));
            }
            if state.buf.len() < want {
                let lost = want - state.buf.len();
                state.stream_ended = true;
                return Some((
                    Err(TempoError::new(
                        StatusCode::DataLoss,
                        format!("{lost} lost bytes: connection closed mid-frame-payload"),
                    )),
                    state,
                ));
            }

            let payload = state.buf.split_to(want).to_vec();
            if let Err(e) = skip_tolerated_crlf(&mut state).await {
                state.stream_ended = true;
                return Some((Err(e), state));
            }
            return Some((Ok(payload), state));
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn payload_stream(items: Vec<Vec<u8>>) -> BoxStream<Result<Vec<u8>, TempoError>> {
        Box::pin(stream::iter(items.into_iter().map(Ok)))
    }

    async fn collect_wire_bytes(s: BoxStream<Result<Bytes, TempoError>>) -> Vec<u8> {
        let chunks: Vec<Bytes> = s.map(|r| r.unwrap()).collect().await;
        chunks.into_iter().flat_map(|b| b.to_vec()).collect()
    }

    fn wire_stream(bytes: Vec<u8>) -> BoxStream<Result<Bytes, TempoError>> {
        Box::pin(stream::once(async move { Ok(Bytes::from(bytes)) }))
    }

    #[tokio::test]
    async fn roundtrip_preserves_order_and_terminates_cleanly() {
        let items = vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()];
        let wire = collect_wire_bytes(write_frames(payload_stream(items.clone()), None, None)).await;

        let mut reader = read_frames(wire_stream(wire), None, None);
        let mut collected = Vec::new();
        while let Some(item) = reader.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, items);
    }

    #[tokio::test]
    async fn heartbeat_frames_are_consumed_without_being_yielded() {
        let heartbeat = frame::encode_header(&FrameHeader::new(0, 0, 11)).unwrap();
        let data_header = frame::encode_header(&FrameHeader::new(3, 0, 11)).unwrap();
        let end = frame::encode_header(&frame::end_stream_header(11)).unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&heartbeat);
        wire.extend_from_slice(&data_header);
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&end);

        let mut reader = read_frames(wire_stream(wire), None, None);
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first, b"abc");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn tolerates_crlf_inserted_after_a_payload() {
        let data_header = frame::encode_header(&FrameHeader::new(2, 0, 3)).unwrap();
        let end = frame::encode_header(&frame::end_stream_header(3)).unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&data_header);
        wire.extend_from_slice(b"hi");
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&end);

        let mut reader = read_frames(wire_stream(wire), None, None);
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first, b"hi");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_connection_mid_payload_raises_data_loss() {
        let data_header = frame::encode_header(&FrameHeader::new(10, 0, 4)).unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&data_header);
        wire.extend_from_slice(b"abc");

        let mut reader = read_frames(wire_stream(wire), None, None);
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.status, StatusCode::DataLoss);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_respects_an_already_cancelled_token() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = write_frames(payload_stream(vec![b"x".to_vec()]), None, Some(cancel));
        let err = out.next().await.unwrap().unwrap_err();
        assert_eq!(err.status, StatusCode::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_fails_deadline_exceeded_when_source_stalls() {
        let deadline = Deadline::from_duration(Duration::from_millis(10));
        let slow_source: BoxStream<Result<Vec<u8>, TempoError>> =
            Box::pin(stream::unfold((), |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Some((Ok(b"late".to_vec()), ()))
            }));
        let mut out = write_frames(slow_source, Some(deadline), None);
        let err = out.next().await.unwrap().unwrap_err();
        assert_eq!(err.status, StatusCode::DeadlineExceeded);
    }
}
