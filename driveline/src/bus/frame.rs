use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a framed payload; larger messages are dropped and the socket
/// closed.
pub const MAX_PAYLOAD_LEN: u32 = 2 * 1024 * 1024;

/// Five little-endian u32 fields: type, reply-required, sequence, reply
/// address, payload length.
pub const HEADER_LEN: usize = 20;

/// Closed set of control-socket message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Event,
    GetConfig,
    GetDeviceId,
}

impl MessageType {
    pub fn as_u32(self) -> u32 {
        match self {
            MessageType::Event => 1,
            MessageType::GetConfig => 2,
            MessageType::GetDeviceId => 3,
        }
    }

    pub fn from_u32(raw: u32) -> Option<MessageType> {
        match raw {
            1 => Some(MessageType::Event),
            2 => Some(MessageType::GetConfig),
            3 => Some(MessageType::GetDeviceId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub reply_required: bool,
    pub seqnum: u32,
    pub reply_to: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Frame {
        Frame {
            msg_type,
            reply_required: false,
            seqnum: 0,
            reply_to: 0,
            payload,
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    Closed,
    #[error("payload length {0} exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(u32),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads one complete frame. A zero-length payload is a valid message.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }

    let field = |i: usize| u32::from_le_bytes(header[i * 4..i * 4 + 4].try_into().expect("4 bytes"));
    let raw_type = field(0);
    let reply_required = field(1) != 0;
    let seqnum = field(2);
    let reply_to = field(3);
    let payload_len = field(4);

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    let msg_type = MessageType::from_u32(raw_type).ok_or(FrameError::UnknownType(raw_type))?;

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        match reader.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Frame {
        msg_type,
        reply_required,
        seqnum,
        reply_to,
        payload,
    })
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() as u32 > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(frame.payload.len() as u32));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.extend_from_slice(&frame.msg_type.as_u32().to_le_bytes());
    buf.extend_from_slice(&u32::from(frame.reply_required).to_le_bytes());
    buf.extend_from_slice(&frame.seqnum.to_le_bytes());
    buf.extend_from_slice(&frame.reply_to.to_le_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&frame.payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// A reply carries the original sequence number so the requester can match
/// it; replies never themselves request a reply.
pub async fn write_reply<W>(writer: &mut W, request: &Frame, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let reply = Frame {
        msg_type: request.msg_type,
        reply_required: false,
        seqnum: request.seqnum,
        reply_to: 0,
        payload: payload.to_vec(),
    };
    write_frame(writer, &reply).await
}
