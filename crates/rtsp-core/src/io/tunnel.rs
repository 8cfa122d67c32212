//! RTSP-over-HTTP and RTSP-over-WebSocket tunnels.
//!
//! Both are sniffed on the first bytes of an accepted TCP connection and
//! are transparent to the layers above: the result is a byte stream the
//! normal RTSP codec runs on.
//!
//! HTTP tunnelling pairs two connections through a shared cookie: the GET
//! connection carries server-to-client bytes in a never-ending response
//! body, the POST connection carries base64-encoded client-to-server
//! bytes. The WebSocket tunnel (subprotocol `rtsp.onvif.org`) carries raw
//! RTSP bytes in binary frames on a single connection.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Sink, Stream as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::Stream;

/// ONVIF WebSocket subprotocol for RTSP.
const WS_SUBPROTOCOL: &str = "rtsp.onvif.org";

/// Upper bound for a tunnelling HTTP request head.
const MAX_HTTP_HEAD: usize = 4096;

/// Pending GET sides of HTTP tunnels, keyed by `x-sessioncookie`.
pub type CookieMap = Arc<DashMap<String, mpsc::UnboundedSender<Bytes>>>;

/// Outcome of sniffing an accepted connection.
pub enum SniffOutcome {
    /// A byte stream to run the RTSP codec on (plain, or a tunnel).
    Rtsp(Box<dyn Stream>),
    /// The connection was absorbed by tunnel plumbing (POST side); no
    /// RTSP connection results from it.
    Absorbed,
}

/// A stream with some already-read bytes put back in front.
pub struct RewindStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> RewindStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct HttpHead {
    method: String,
    headers: Vec<(String, String)>,
    raw: Vec<u8>,
}

impl HttpHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_http_head(stream: &mut TcpStream, first: &[u8]) -> Result<HttpHead> {
    let mut raw = first.to_vec();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if raw.len() > MAX_HTTP_HEAD {
            return Err(Error::MalformedMessage("HTTP head too long".into()));
        }
        stream.read_exact(&mut byte).await?;
        raw.push(byte[0]);
    }
    let text = std::str::from_utf8(&raw)
        .map_err(|_| Error::MalformedMessage("invalid HTTP head".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Error::MalformedMessage("empty HTTP head".into()))?;
    let method = request_line
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_string();
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(HttpHead {
        method,
        headers,
        raw,
    })
}

/// Inspects the first bytes of an accepted connection and upgrades HTTP /
/// WebSocket tunnels. Plain RTSP connections pass through untouched.
pub async fn sniff(mut stream: TcpStream, cookies: &CookieMap) -> Result<SniffOutcome> {
    let mut first = [0u8; 4];
    stream.read_exact(&mut first).await?;
    if &first != b"GET " && &first != b"POST" {
        return Ok(SniffOutcome::Rtsp(Box::new(RewindStream::new(
            first.to_vec(),
            stream,
        ))));
    }

    let head = read_http_head(&mut stream, &first).await?;

    // WebSocket upgrade with the ONVIF subprotocol.
    if head
        .header("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        if !head
            .header("Sec-WebSocket-Protocol")
            .map(|v| v.split(',').any(|p| p.trim() == WS_SUBPROTOCOL))
            .unwrap_or(false)
        {
            return Err(Error::MalformedMessage(
                "WebSocket upgrade without RTSP subprotocol".into(),
            ));
        }
        // The handshake library re-parses the head from the rewound bytes.
        let rewound = RewindStream::new(head.raw, stream);
        let ws = tokio_tungstenite::accept_hdr_async(
            rewound,
            |_req: &WsRequest, mut res: WsResponse| -> std::result::Result<WsResponse, ErrorResponse> {
                res.headers_mut().append(
                    "Sec-WebSocket-Protocol",
                    WS_SUBPROTOCOL.parse().expect("static header value"),
                );
                Ok(res)
            },
        )
        .await
        .map_err(|e| Error::MalformedMessage(format!("WebSocket handshake failed: {e}")))?;
        debug!("WebSocket tunnel established");
        return Ok(SniffOutcome::Rtsp(Box::new(WsByteStream::new(ws))));
    }

    let cookie = head
        .header("x-sessioncookie")
        .ok_or_else(|| Error::MalformedMessage("HTTP tunnel without session cookie".into()))?
        .to_string();

    match head.method.as_str() {
        "GET" => {
            stream
                .write_all(
                    b"HTTP/1.0 200 OK\r\n\
                      Cache-Control: no-cache\r\n\
                      Pragma: no-cache\r\n\
                      Content-Type: application/x-rtsp-tunnelled\r\n\
                      \r\n",
                )
                .await?;
            let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
            cookies.insert(cookie.clone(), upstream_tx);
            debug!("HTTP tunnel GET side registered (cookie {cookie})");
            Ok(SniffOutcome::Rtsp(Box::new(HttpTunnelStream {
                rx: upstream_rx,
                pending: Bytes::new(),
                writer: stream,
            })))
        }
        "POST" => {
            let Some((_, upstream_tx)) = cookies.remove(&cookie) else {
                let _ = stream.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
                return Err(Error::MalformedMessage(format!(
                    "HTTP tunnel POST with unknown cookie '{cookie}'"
                )));
            };
            debug!("HTTP tunnel POST side paired (cookie {cookie})");
            // Absorb this connection: forward decoded bytes until EOF.
            let mut decoder = Base64StreamDecoder::new();
            let mut buf = [0u8; 2048];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                match decoder.push(&buf[..n]) {
                    Ok(decoded) if !decoded.is_empty() => {
                        if upstream_tx.send(decoded).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        trace!("tunnel base64 error: {e}");
                        break;
                    }
                }
            }
            Ok(SniffOutcome::Absorbed)
        }
        other => Err(Error::MalformedMessage(format!(
            "unsupported HTTP tunnel method '{other}'"
        ))),
    }
}

/// Incremental base64 decoder for the POST upstream.
struct Base64StreamDecoder {
    pending: Vec<u8>,
}

impl Base64StreamDecoder {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<Bytes> {
        self.pending
            .extend(data.iter().filter(|b| !b"\r\n".contains(b)));
        let usable = self.pending.len() / 4 * 4;
        if usable == 0 {
            return Ok(Bytes::new());
        }
        let chunk: Vec<u8> = self.pending.drain(..usable).collect();
        let decoded = BASE64
            .decode(&chunk)
            .map_err(|e| Error::MalformedMessage(format!("invalid tunnel base64: {e}")))?;
        Ok(Bytes::from(decoded))
    }
}

/// The paired HTTP tunnel as one byte stream: reads come from the decoded
/// POST side, writes go raw into the GET response body.
struct HttpTunnelStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    writer: TcpStream,
}

impl AsyncRead for HttpTunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for HttpTunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// A WebSocket connection exposed as a plain byte stream: binary frames
/// in, binary frames out.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }
}

fn ws_io_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(WsMessage::Binary(data)))) => {
                    self.pending = Bytes::from(data);
                }
                Poll::Ready(Some(Ok(WsMessage::Text(text)))) => {
                    self.pending = Bytes::from(text.into_bytes());
                }
                // Control frames are handled by the library.
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_err(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut self.inner)
            .start_send(WsMessage::Binary(data.to_vec()))
            .map_err(ws_io_err)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn rewind_serves_prefix_first() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(b"WORLD").await.unwrap();
        let mut s = RewindStream::new(b"HELLO ".to_vec(), b);
        let mut out = [0u8; 11];
        s.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"HELLO WORLD");
    }

    #[test]
    fn base64_decoder_chunks() {
        let mut d = Base64StreamDecoder::new();
        let encoded = BASE64.encode(b"OPTIONS rtsp://h/ RTSP/1.0\r\n\r\n");
        let bytes = encoded.as_bytes();
        let mut out = Vec::new();
        // Feed in awkward chunk sizes.
        for chunk in bytes.chunks(5) {
            out.extend_from_slice(&d.push(chunk).unwrap());
        }
        assert_eq!(out, b"OPTIONS rtsp://h/ RTSP/1.0\r\n\r\n");
    }

    #[tokio::test]
    async fn plain_rtsp_passes_through() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cookies: CookieMap = Arc::new(DashMap::new());

        let client = tokio::spawn(async move {
            let mut c = TcpStream::connect(addr).await.unwrap();
            c.write_all(b"OPTIONS rtsp://h/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
                .await
                .unwrap();
            c
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let outcome = sniff(server_stream, &cookies).await.unwrap();
        let SniffOutcome::Rtsp(mut stream) = outcome else {
            panic!("expected an RTSP stream");
        };
        let mut head = [0u8; 7];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"OPTIONS");
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn http_tunnel_pairs_get_and_post() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cookies: CookieMap = Arc::new(DashMap::new());

        // GET side.
        let mut get_conn = TcpStream::connect(addr).await.unwrap();
        get_conn
            .write_all(
                b"GET /stream HTTP/1.0\r\n\
                  x-sessioncookie: abc123\r\n\
                  Accept: application/x-rtsp-tunnelled\r\n\r\n",
            )
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let outcome = sniff(accepted, &cookies).await.unwrap();
        let SniffOutcome::Rtsp(mut tunnel) = outcome else {
            panic!("expected tunnel stream");
        };

        // The GET socket got the tunnelling response.
        let mut response = [0u8; 17];
        get_conn.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.0 200 OK\r\n");

        // POST side, absorbed by its own sniff call.
        let mut post_conn = TcpStream::connect(addr).await.unwrap();
        let mut post_head = b"POST /stream HTTP/1.0\r\nx-sessioncookie: abc123\r\n\r\n".to_vec();
        post_head.extend_from_slice(BASE64.encode(b"PLAY rtsp").as_bytes());
        post_conn.write_all(&post_head).await.unwrap();
        post_conn.shutdown().await.unwrap();

        let (accepted, _) = listener.accept().await.unwrap();
        let cookies2 = cookies.clone();
        let absorbed = tokio::spawn(async move { sniff(accepted, &cookies2).await });

        // Upstream bytes surface on the tunnel stream, decoded.
        let mut got = [0u8; 9];
        tunnel.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"PLAY rtsp");
        assert!(matches!(
            absorbed.await.unwrap().unwrap(),
            SniffOutcome::Absorbed
        ));

        // Server-to-client writes land raw on the GET socket.
        tunnel.write_all(b"RTSP/1.0 200 OK\r\n").await.unwrap();
        let mut down = [0u8; 8];
        // Skip the remaining tunnelling response headers first.
        let mut rest = Vec::new();
        loop {
            let mut b = [0u8; 1];
            get_conn.read_exact(&mut b).await.unwrap();
            rest.push(b[0]);
            if rest.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        get_conn.read_exact(&mut down).await.unwrap();
        assert_eq!(&down, b"RTSP/1.0");
    }
}
