//! Wire encoding of tasks, outcomes and protocol frames.
//!
//! A task is `kind (u8) | rid (u16 len + utf8) | expected version | payload`,
//! where the payload of content-carrying kinds is `content (u32 len + bytes) |
//! new version`. Frames wrap a payload as `op (u8) | len (u32) | payload |
//! crc32`, the checksum covering everything before it.

use std::io::ErrorKind;

use storage::buf::{put_bytes, put_utf};
use storage::{ByteReader, DecodeError, RecordId, RecordSnapshot, RecordVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ClusterError;
use crate::outcome::ExecutionOutcome;
use crate::task::{RecordTask, TaskKind};

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const TASK_CREATE: u8 = 1;
const TASK_UPDATE: u8 = 2;
const TASK_DELETE: u8 = 3;
const TASK_RESURRECT: u8 = 4;
const TASK_OVERWRITE: u8 = 5;

const OUTCOME_APPLIED: u8 = 1;
const OUTCOME_CONFLICT: u8 = 2;
const OUTCOME_ERROR: u8 = 3;

pub fn encode_task(task: &RecordTask) -> Vec<u8> {
    let mut buf = Vec::new();
    let tag = match task.kind {
        TaskKind::Create { .. } => TASK_CREATE,
        TaskKind::Update { .. } => TASK_UPDATE,
        TaskKind::Delete => TASK_DELETE,
        TaskKind::Resurrect => TASK_RESURRECT,
        TaskKind::Overwrite { .. } => TASK_OVERWRITE,
    };
    buf.push(tag);
    put_utf(&mut buf, &task.rid.to_string());
    task.version.encode(&mut buf);

    match &task.kind {
        TaskKind::Create { content, new_version }
        | TaskKind::Update { content, new_version }
        | TaskKind::Overwrite { content, new_version } => {
            put_bytes(&mut buf, content);
            new_version.encode(&mut buf);
        }
        TaskKind::Delete | TaskKind::Resurrect => {}
    }
    buf
}

pub fn decode_task(data: &[u8]) -> Result<RecordTask, DecodeError> {
    let mut reader = ByteReader::new(data);
    let tag = reader.read_u8()?;
    let rid: RecordId = reader.read_utf("record id")?.parse()?;
    let version = RecordVersion::decode(&mut reader)?;

    let kind = match tag {
        TASK_DELETE => TaskKind::Delete,
        TASK_RESURRECT => TaskKind::Resurrect,
        TASK_CREATE | TASK_UPDATE | TASK_OVERWRITE => {
            let content = reader.read_bytes()?;
            let new_version = RecordVersion::decode(&mut reader)?;
            match tag {
                TASK_CREATE => TaskKind::Create { content, new_version },
                TASK_UPDATE => TaskKind::Update { content, new_version },
                _ => TaskKind::Overwrite { content, new_version },
            }
        }
        other => return Err(DecodeError::UnknownTag { what: "task", tag: other }),
    };
    reader.finish()?;

    Ok(RecordTask { rid, version, kind })
}

pub fn encode_outcome(outcome: &ExecutionOutcome) -> Vec<u8> {
    let mut buf = Vec::new();
    match outcome {
        ExecutionOutcome::Applied { before, after } => {
            buf.push(OUTCOME_APPLIED);
            put_snapshot(&mut buf, before.as_ref());
            put_snapshot(&mut buf, after.as_ref());
        }
        ExecutionOutcome::Conflict { observed } => {
            buf.push(OUTCOME_CONFLICT);
            observed.encode(&mut buf);
        }
        ExecutionOutcome::Error { message } => {
            buf.push(OUTCOME_ERROR);
            put_bytes(&mut buf, message.as_bytes());
        }
    }
    buf
}

pub fn decode_outcome(data: &[u8]) -> Result<ExecutionOutcome, DecodeError> {
    let mut reader = ByteReader::new(data);
    let outcome = match reader.read_u8()? {
        OUTCOME_APPLIED => {
            let before = read_snapshot(&mut reader)?;
            let after = read_snapshot(&mut reader)?;
            ExecutionOutcome::Applied { before, after }
        }
        OUTCOME_CONFLICT => ExecutionOutcome::Conflict {
            observed: RecordVersion::decode(&mut reader)?,
        },
        OUTCOME_ERROR => {
            let message =
                String::from_utf8(reader.read_bytes()?).map_err(|_| DecodeError::InvalidUtf8("error message"))?;
            ExecutionOutcome::Error { message }
        }
        other => return Err(DecodeError::UnknownTag { what: "outcome", tag: other }),
    };
    reader.finish()?;
    Ok(outcome)
}

fn put_snapshot(buf: &mut Vec<u8>, snapshot: Option<&RecordSnapshot>) {
    match snapshot {
        Some(snapshot) => {
            buf.push(1);
            snapshot.version.encode(buf);
            put_bytes(buf, &snapshot.content);
        }
        None => buf.push(0),
    }
}

fn read_snapshot(reader: &mut ByteReader<'_>) -> Result<Option<RecordSnapshot>, DecodeError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => {
            let version = RecordVersion::decode(reader)?;
            let content = reader.read_bytes()?;
            Ok(Some(RecordSnapshot { content, version }))
        }
        other => Err(DecodeError::UnknownTag { what: "snapshot presence", tag: other }),
    }
}

pub fn encode_frame(op: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 9);
    frame.push(op);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, op: u8, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(&encode_frame(op, payload)).await?;
    writer.flush().await
}

/// Read one frame. Returns `Ok(None)` when the peer closed the connection
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>, ClusterError> {
    let op = match reader.read_u8().await {
        Ok(op) => op,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(None),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(len).into());
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let stored = reader.read_u32().await?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[op]);
    hasher.update(&(len as u32).to_be_bytes());
    hasher.update(&payload);
    let calculated = hasher.finalize();
    if stored != calculated {
        return Err(DecodeError::ChecksumMismatch { stored, calculated }.into());
    }

    Ok(Some((op, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CLUSTER_OP_TASK;

    fn rid() -> RecordId {
        RecordId::new(10, 5)
    }

    #[test]
    fn test_task_roundtrip() {
        let distributed = RecordVersion::Distributed {
            counter: 3,
            timestamp: 1_700_000_000_000,
            node: 42,
        };
        let tasks = [
            RecordTask::delete(rid(), RecordVersion::Simple(3)),
            RecordTask::resurrect(rid(), distributed),
            RecordTask::update(rid(), distributed, vec![0u8, 1, 2, 255]),
            RecordTask::create(RecordId::new(-2, i64::MAX), "", RecordVersion::initial()),
            RecordTask::overwrite(rid(), RecordVersion::Simple(9), RecordSnapshot::new("x", RecordVersion::Untracked)),
        ];

        for task in tasks {
            let decoded = decode_task(&encode_task(&task)).unwrap();
            assert_eq!(decoded, task);
        }
    }

    #[test]
    fn test_delete_layout() {
        let bytes = encode_task(&RecordTask::delete(rid(), RecordVersion::Simple(3)));
        let mut expected = vec![TASK_DELETE, 0, 5];
        expected.extend_from_slice(b"#10:5");
        expected.push(1);
        expected.extend_from_slice(&3i32.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_unknown_task_tag() {
        let mut bytes = encode_task(&RecordTask::delete(rid(), RecordVersion::Simple(3)));
        bytes[0] = 99;
        assert_eq!(
            decode_task(&bytes).unwrap_err(),
            DecodeError::UnknownTag { what: "task", tag: 99 }
        );
    }

    #[test]
    fn test_unknown_version_tag() {
        let mut bytes = encode_task(&RecordTask::delete(rid(), RecordVersion::Simple(3)));
        // version tag follows the 1 byte kind and 7 byte rid
        bytes[8] = 7;
        assert!(matches!(
            decode_task(&bytes).unwrap_err(),
            DecodeError::UnknownTag { what: "version", tag: 7 }
        ));
    }

    #[test]
    fn test_truncated_task() {
        let bytes = encode_task(&RecordTask::update(rid(), RecordVersion::Simple(1), "content"));
        for cut in [1, 5, bytes.len() - 1] {
            assert!(decode_task(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_bad_record_id() {
        let mut bytes = vec![TASK_DELETE];
        put_utf(&mut bytes, "#ten:5");
        RecordVersion::Simple(1).encode(&mut bytes);
        assert!(matches!(decode_task(&bytes), Err(DecodeError::InvalidRecordId(_))));
    }

    #[test]
    fn test_outcome_roundtrip() {
        let outcomes = [
            ExecutionOutcome::Applied {
                before: Some(RecordSnapshot::new("old", RecordVersion::Simple(3))),
                after: None,
            },
            ExecutionOutcome::Conflict { observed: RecordVersion::Simple(4) },
            ExecutionOutcome::error("disk full"),
        ];
        for outcome in outcomes {
            assert_eq!(decode_outcome(&encode_outcome(&outcome)).unwrap(), outcome);
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let payload = encode_task(&RecordTask::delete(rid(), RecordVersion::Simple(3)));
        let frame = encode_frame(CLUSTER_OP_TASK, &payload);

        let mut reader = &frame[..];
        let (op, body) = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(op, CLUSTER_OP_TASK);
        assert_eq!(body, payload);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_crc_mismatch() {
        let mut frame = encode_frame(CLUSTER_OP_TASK, b"payload");
        frame[6] ^= 0xff;

        let mut reader = &frame[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, ClusterError::Decode(DecodeError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let mut frame = vec![CLUSTER_OP_TASK];
        frame.extend_from_slice(&u32::MAX.to_be_bytes());

        let mut reader = &frame[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, ClusterError::Decode(DecodeError::FrameTooLarge(_))));
    }
}
