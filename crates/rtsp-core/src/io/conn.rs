//! The RTSP wire codec: framing of requests, responses and interleaved
//! binary frames over one buffered byte stream.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::message::{
    HeaderMap, Request, Response, MAX_HEADER_COUNT, MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN,
};

use super::Stream;

/// Interleaved frame marker byte (`$`).
const FRAME_MAGIC: u8 = 0x24;

/// Upper bound for one start line or header line.
const MAX_LINE_LEN: usize = 2 * 1024 + 64;

/// Upper bound for message bodies (SDP documents, parameter payloads).
const MAX_BODY_LEN: usize = 128 * 1024;

/// Anything that can arrive on an RTSP connection.
#[derive(Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    /// Interleaved binary frame: RTP or RTCP tunnelled in-band.
    Frame { channel: u8, payload: Bytes },
}

/// Reader half of an RTSP connection.
///
/// The single `read` operation peeks the first byte to distinguish an
/// interleaved frame (`$`) from a text message, then parses accordingly.
pub struct Conn<S: Stream> {
    reader: BufReader<ReadHalf<S>>,
    writer: ConnWriter<S>,
    max_frame_payload: usize,
}

/// Cloneable writer half; serialises whole messages under one lock so that
/// frames are never interleaved with other writes on the same socket.
pub struct ConnWriter<S: Stream> {
    writer: Arc<Mutex<WriteHalf<S>>>,
}

impl<S: Stream> Clone for ConnWriter<S> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<S: Stream> Conn<S> {
    pub fn new(stream: S, max_frame_payload: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: ConnWriter {
                writer: Arc::new(Mutex::new(write_half)),
            },
            max_frame_payload,
        }
    }

    /// Handle to the writer half.
    pub fn writer(&self) -> ConnWriter<S> {
        self.writer.clone()
    }

    /// Reads the next message or interleaved frame.
    pub async fn read(&mut self) -> Result<Message> {
        let first = self.peek_byte().await?;
        if first == FRAME_MAGIC {
            self.read_frame().await
        } else {
            self.read_text_message().await
        }
    }

    async fn peek_byte(&mut self) -> Result<u8> {
        let buf = self.reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        Ok(buf[0])
    }

    async fn read_frame(&mut self) -> Result<Message> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).await?;
        let channel = header[1];
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if len > self.max_frame_payload {
            return Err(Error::FrameTooBig {
                size: len,
                max: self.max_frame_payload,
            });
        }
        let mut payload = BytesMut::zeroed(len);
        self.reader.read_exact(&mut payload).await?;
        Ok(Message::Frame {
            channel,
            payload: payload.freeze(),
        })
    }

    /// Reads one CRLF-terminated line, without the terminator.
    async fn read_line(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut raw)
            .await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        if raw.last() != Some(&b'\n') {
            return Err(Error::MalformedMessage("line too long".into()));
        }
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        String::from_utf8(raw).map_err(|_| Error::MalformedMessage("invalid UTF-8 in head".into()))
    }

    async fn read_text_message(&mut self) -> Result<Message> {
        let start_line = self.read_line().await?;

        let mut headers = HeaderMap::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= MAX_HEADER_COUNT {
                return Err(Error::MalformedMessage("too many headers".into()));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::MalformedMessage(format!("invalid header '{line}'")))?;
            let value = value.trim();
            if name.len() > MAX_HEADER_NAME_LEN {
                return Err(Error::MalformedMessage("header name too long".into()));
            }
            if value.len() > MAX_HEADER_VALUE_LEN {
                return Err(Error::MalformedMessage("header value too long".into()));
            }
            headers.add(name, value);
        }

        let body = match headers.get("Content-Length") {
            Some(v) => {
                let len: usize = v
                    .parse()
                    .map_err(|_| Error::MalformedMessage(format!("invalid Content-Length '{v}'")))?;
                if len > MAX_BODY_LEN {
                    return Err(Error::MalformedMessage("body too long".into()));
                }
                let mut body = BytesMut::zeroed(len);
                self.reader.read_exact(&mut body).await?;
                body.freeze()
            }
            None => Bytes::new(),
        };

        if start_line.starts_with("RTSP/") {
            Ok(Message::Response(Response::from_parts(
                &start_line,
                headers,
                body,
            )?))
        } else {
            Ok(Message::Request(Request::from_parts(
                &start_line,
                headers,
                body,
            )?))
        }
    }
}

impl<S: Stream> ConnWriter<S> {
    pub async fn write_request(&self, req: &Request) -> Result<()> {
        self.write_all(&req.encode()).await
    }

    pub async fn write_response(&self, res: &Response) -> Result<()> {
        self.write_all(&res.encode()).await
    }

    /// Writes one interleaved frame as a single contiguous write, using the
    /// caller's scratch buffer to assemble header and payload.
    pub async fn write_interleaved_frame(
        &self,
        channel: u8,
        payload: &[u8],
        scratch: &mut BytesMut,
    ) -> Result<()> {
        scratch.clear();
        scratch.reserve(4 + payload.len());
        scratch.put_u8(FRAME_MAGIC);
        scratch.put_u8(channel);
        scratch.put_u16(payload.len() as u16);
        scratch.put_slice(payload);
        self.write_all(scratch).await
    }

    async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, StatusCode};
    use url::Url;

    async fn pipe() -> (Conn<tokio::net::TcpStream>, Conn<tokio::net::TcpStream>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (
            Conn::new(client.unwrap(), super::super::DEFAULT_MAX_PACKET_SIZE),
            Conn::new(server.unwrap().0, super::super::DEFAULT_MAX_PACKET_SIZE),
        )
    }

    #[tokio::test]
    async fn request_round_trip() {
        let (client, mut server) = pipe().await;
        let mut req = Request::new(Method::Options, Url::parse("rtsp://h/stream").unwrap());
        req.headers.add("CSeq", "1");
        client.writer().write_request(&req).await.unwrap();

        match server.read().await.unwrap() {
            Message::Request(got) => {
                assert_eq!(got.method, Method::Options);
                assert_eq!(got.cseq().unwrap(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_with_body_round_trip() {
        let (client, mut server) = pipe().await;
        let mut res = Response::new(StatusCode::OK);
        res.headers.add("CSeq", "2");
        res.headers.add("Content-Type", "application/sdp");
        res.body = Bytes::from_static(b"v=0\r\n");
        client.writer().write_response(&res).await.unwrap();

        match server.read().await.unwrap() {
            Message::Response(got) => {
                assert_eq!(got.status, StatusCode::OK);
                assert_eq!(&got.body[..], b"v=0\r\n");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (client, mut server) = pipe().await;
        let mut scratch = BytesMut::new();
        client
            .writer()
            .write_interleaved_frame(2, &[1, 2, 3, 4], &mut scratch)
            .await
            .unwrap();

        match server.read().await.unwrap() {
            Message::Frame { channel, payload } => {
                assert_eq!(channel, 2);
                assert_eq!(&payload[..], &[1, 2, 3, 4]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frame_after_message_keeps_framing() {
        let (client, mut server) = pipe().await;
        let mut req = Request::new(Method::Play, Url::parse("rtsp://h/stream").unwrap());
        req.headers.add("CSeq", "4");
        let w = client.writer();
        w.write_request(&req).await.unwrap();
        let mut scratch = BytesMut::new();
        w.write_interleaved_frame(0, &[9, 9], &mut scratch).await.unwrap();

        assert!(matches!(server.read().await.unwrap(), Message::Request(_)));
        match server.read().await.unwrap() {
            Message::Frame { channel, payload } => {
                assert_eq!(channel, 0);
                assert_eq!(&payload[..], &[9, 9]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_count_limit() {
        let (client, mut server) = pipe().await;

        // Exactly at the limit: accepted.
        let mut req = Request::new(Method::Options, Url::parse("rtsp://h/s").unwrap());
        for i in 0..MAX_HEADER_COUNT {
            req.headers.add(format!("X-H{i}"), "v");
        }
        client.writer().write_request(&req).await.unwrap();
        assert!(matches!(server.read().await.unwrap(), Message::Request(_)));

        // One past the limit: rejected.
        let mut req = Request::new(Method::Options, Url::parse("rtsp://h/s").unwrap());
        for i in 0..=MAX_HEADER_COUNT {
            req.headers.add(format!("X-H{i}"), "v");
        }
        client.writer().write_request(&req).await.unwrap();
        assert!(matches!(
            server.read().await,
            Err(Error::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn header_value_length_limit() {
        let (client, mut server) = pipe().await;
        let w = client.writer();

        let mut req = Request::new(Method::Options, Url::parse("rtsp://h/s").unwrap());
        req.headers.add("X-Fill", "v".repeat(MAX_HEADER_VALUE_LEN));
        w.write_request(&req).await.unwrap();
        assert!(matches!(server.read().await.unwrap(), Message::Request(_)));

        let mut req = Request::new(Method::Options, Url::parse("rtsp://h/s").unwrap());
        req.headers.add("X-Fill", "v".repeat(MAX_HEADER_VALUE_LEN + 1));
        w.write_request(&req).await.unwrap();
        assert!(matches!(
            server.read().await,
            Err(Error::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        let mut client = client.unwrap();
        let mut server_conn = Conn::new(server.unwrap().0, 16);

        let mut frame = vec![0x24u8, 0, 0, 17];
        frame.extend_from_slice(&[0u8; 17]);
        client.write_all(&frame).await.unwrap();
        assert!(matches!(
            server_conn.read().await,
            Err(Error::FrameTooBig { size: 17, max: 16 })
        ));
    }
}
