use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::Name;
use hickory_proto::serialize::binary::BinDecodable;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::field::Empty;
use tracing::instrument;

use crate::cancel::CancelToken;
use crate::errors::ResolveError;
use crate::options::ClientSubnet;
use crate::question::Question;

/// Max size for the UDP receive buffer as recommended by
/// [RFC6891](https://datatracker.ietf.org/doc/html/rfc6891#section-6.2.5).
pub const MAX_RECEIVE_BUFFER_SIZE: usize = 4096;

const CLIENT_SUBNET_OPTION_CODE: u16 = 8;

/// Everything the dispatcher needs to put one question on the wire.
/// Retries, timeouts, and protocol fallback are the dispatcher's
/// business; the caller sees only the final outcome.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub question: Question,
    pub randomize_name: bool,
    pub dnssec: bool,
    pub udp_payload_size: u16,
    pub client_subnet: Option<ClientSubnet>,
    pub retries: u32,
    pub timeout: Duration,
}

/// A dispatcher passes a question to one remote server and returns the
/// decoded response or a categorized failure.
#[async_trait]
pub trait Dispatcher: Debug + Send + Sync {
    async fn query(
        &self,
        endpoint: SocketAddr,
        request: &DispatchRequest,
        cancel: &CancelToken,
    ) -> Result<Message, ResolveError>;
}

/// The standard dispatcher: UDP with EDNS(0), falling back to TCP when
/// the server truncates. One ephemeral socket per query.
#[derive(Debug, Default)]
pub struct UdpDispatcher;

impl UdpDispatcher {
    pub fn new() -> Self {
        UdpDispatcher
    }

    async fn udp_round(
        &self,
        endpoint: SocketAddr,
        wire: &[u8],
        id: u16,
        sent_name: &Name,
        strict_case: bool,
    ) -> Result<Message, ResolveError> {
        let socket = connect(endpoint).await?;
        socket.send(wire).await?;
        let mut buf = vec![0u8; MAX_RECEIVE_BUFFER_SIZE];
        let read_count = socket.recv(&mut buf).await?;
        let message = Message::from_bytes(&buf[..read_count])?;
        if !matches_request(&message, id, sent_name, strict_case) {
            return Err(ResolveError::NoResponse);
        }
        Ok(message)
    }

    async fn tcp_round(
        &self,
        endpoint: SocketAddr,
        wire: &[u8],
        id: u16,
        sent_name: &Name,
        strict_case: bool,
    ) -> Result<Message, ResolveError> {
        let mut stream = TcpStream::connect(endpoint).await?;
        stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
        stream.write_all(wire).await?;
        stream.flush().await?;

        let mut length = [0u8; 2];
        stream.read_exact(&mut length).await?;
        let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
        stream.read_exact(&mut body).await?;

        let message = Message::from_bytes(&body)?;
        if !matches_request(&message, id, sent_name, strict_case) {
            return Err(ResolveError::NoResponse);
        }
        Ok(message)
    }
}

#[async_trait]
impl Dispatcher for UdpDispatcher {
    // status starts out as Error and is overwritten on the success path,
    // so early returns via ? are recorded correctly
    #[instrument(skip_all, fields(otel.status_code = "Error", %endpoint, question = %request.question, response_code = Empty))]
    async fn query(
        &self,
        endpoint: SocketAddr,
        request: &DispatchRequest,
        cancel: &CancelToken,
    ) -> Result<Message, ResolveError> {
        let (message, sent_name) = make_request(request);
        let id = message.id();
        let wire = message.to_vec()?;

        let mut last_error = ResolveError::NoResponse;
        for _attempt in 0..=request.retries {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            let round = self.udp_round(endpoint, &wire, id, &sent_name, request.randomize_name);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                outcome = tokio::time::timeout(request.timeout, round) => outcome,
            };
            let message = match outcome {
                Err(_elapsed) => {
                    last_error = ResolveError::Timeout;
                    continue;
                }
                Ok(Err(e)) => {
                    last_error = e;
                    continue;
                }
                Ok(Ok(message)) => message,
            };
            let message = if message.truncated() {
                let round =
                    self.tcp_round(endpoint, &wire, id, &sent_name, request.randomize_name);
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                    outcome = tokio::time::timeout(request.timeout, round) => outcome,
                };
                match outcome {
                    Err(_elapsed) => {
                        last_error = ResolveError::Timeout;
                        continue;
                    }
                    Ok(Err(e)) => {
                        last_error = e;
                        continue;
                    }
                    Ok(Ok(message)) => message,
                }
            } else {
                message
            };
            let span = tracing::Span::current();
            span.record("otel.status_code", "Ok");
            span.record("response_code", format!("{}", message.header().response_code()));
            return Ok(message);
        }
        Err(last_error)
    }
}

async fn connect(endpoint: SocketAddr) -> Result<UdpSocket, ResolveError> {
    let local = SocketAddr::new(
        match endpoint.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        },
        0,
    );
    let socket = UdpSocket::bind(local).await?;
    socket.connect(endpoint).await?;
    Ok(socket)
}

fn make_request(request: &DispatchRequest) -> (Message, Name) {
    let mut name = request.question.effective_name().clone();
    if request.randomize_name {
        name = randomize_case(&name);
    }
    let mut query = Query::new();
    query
        .set_name(name.clone())
        .set_query_type(request.question.effective_type())
        .set_query_class(request.question.query_class);

    let mut message = Message::new();
    message.add_query(query);
    message.set_id(rand::random());
    message.set_recursion_desired(false);
    message.set_authentic_data(request.dnssec);

    let mut edns = Edns::new();
    edns.set_max_payload(request.udp_payload_size);
    edns.set_version(0);
    edns.set_dnssec_ok(request.dnssec);
    if let Some(subnet) = &request.client_subnet {
        edns.options_mut().insert(EdnsOption::Unknown(CLIENT_SUBNET_OPTION_CODE, subnet.to_wire()));
    }
    message.set_edns(edns);

    (message, name)
}

/// dns0x20: scramble the 0x20 bit of every letter in the query name.
/// The response must echo the exact case back or it is discarded.
fn randomize_case(name: &Name) -> Name {
    let mut rng = rand::thread_rng();
    let labels: Vec<Vec<u8>> = name
        .iter()
        .map(|label| {
            label
                .iter()
                .map(|b| if b.is_ascii_alphabetic() && rng.gen::<bool>() { b ^ 0x20 } else { *b })
                .collect()
        })
        .collect();
    match Name::from_labels(labels) {
        Ok(mut randomized) => {
            randomized.set_fqdn(name.is_fqdn());
            randomized
        }
        Err(_) => name.clone(),
    }
}

fn matches_request(response: &Message, id: u16, sent_name: &Name, strict_case: bool) -> bool {
    if response.id() != id {
        return false;
    }
    match response.queries().first() {
        None => false,
        Some(echoed) if strict_case => echoed.name().eq_case(sent_name),
        Some(echoed) => echoed.name() == sent_name,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        make_request, matches_request, randomize_case, DispatchRequest, Dispatcher, UdpDispatcher,
        MAX_RECEIVE_BUFFER_SIZE,
    };
    use crate::cancel::{CancelSource, CancelToken};
    use crate::errors::ResolveError;
    use crate::question::Question;
    use anyhow::Result;
    use hickory_proto::op::{Message, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use hickory_proto::serialize::binary::BinDecodable;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::task::JoinHandle;

    fn request(name: &str) -> Result<DispatchRequest> {
        Ok(DispatchRequest {
            question: Question::new(Name::from_str(name)?, RecordType::A),
            randomize_name: false,
            dnssec: false,
            udp_payload_size: 1232,
            client_subnet: None,
            retries: 0,
            timeout: Duration::from_secs(2),
        })
    }

    fn make_response(request: Message) -> Message {
        let mut message = Message::new();
        message.add_query(request.queries().first().unwrap().clone());
        message.set_id(request.id());
        message.set_response_code(ResponseCode::NoError);
        message.add_answer(Record::from_rdata(
            Name::from_str("stacey.a.b.").unwrap(),
            600,
            RData::A(A::new(172, 104, 148, 31)),
        ));
        message
    }

    async fn udp_responder(
        truncate: bool,
    ) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let socket =
            UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = socket.local_addr()?;
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_RECEIVE_BUFFER_SIZE];
            let (read_count, peer) = socket.recv_from(&mut buf).await?;
            let request = Message::from_bytes(&buf[..read_count])?;
            let mut response = make_response(request);
            if truncate {
                response.set_truncated(true);
            }
            socket.send_to(response.to_vec()?.as_slice(), peer).await?;
            Ok(())
        });
        Ok((addr, handle))
    }

    #[tokio::test]
    async fn test_udp_interaction() -> Result<()> {
        let (addr, handle) = udp_responder(false).await?;
        let dispatcher = UdpDispatcher::new();
        let message = dispatcher
            .query(addr, &request("stacey.a.b.")?, &CancelToken::never())
            .await?;
        assert_eq!(ResponseCode::NoError, message.response_code());
        let expected = Record::from_rdata(
            Name::from_str("stacey.a.b.")?,
            600,
            RData::A("172.104.148.31".parse()?),
        );
        assert_eq!(message.answers(), [expected]);
        handle.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_after_retries() -> Result<()> {
        // bind a socket that never answers
        let socket =
            UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = socket.local_addr()?;
        let dispatcher = UdpDispatcher::new();
        let mut req = request("stacey.a.b.")?;
        req.timeout = Duration::from_millis(20);
        req.retries = 1;
        let result = dispatcher.query(addr, &req, &CancelToken::never()).await;
        assert!(matches!(result, Err(ResolveError::Timeout)));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_preempts_query() -> Result<()> {
        let socket =
            UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = socket.local_addr()?;
        let (source, token) = CancelSource::new();
        source.cancel();
        let dispatcher = UdpDispatcher::new();
        let result = dispatcher.query(addr, &request("stacey.a.b.")?, &token).await;
        assert!(matches!(result, Err(ResolveError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_truncation_falls_back_to_tcp() -> Result<()> {
        let (udp_addr, udp_handle) = udp_responder(true).await?;
        // a TCP listener on the same port answering with the full message
        let listener = TcpListener::bind(udp_addr).await?;
        let tcp_handle: JoinHandle<Result<()>> = tokio::spawn(async move {
            let (mut stream, _peer) = listener.accept().await?;
            let mut length = [0u8; 2];
            stream.read_exact(&mut length).await?;
            let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
            stream.read_exact(&mut body).await?;
            let request = Message::from_bytes(&body)?;
            let wire = make_response(request).to_vec()?;
            stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
            stream.write_all(&wire).await?;
            Ok(())
        });

        let dispatcher = UdpDispatcher::new();
        let message = dispatcher
            .query(udp_addr, &request("stacey.a.b.")?, &CancelToken::never())
            .await?;
        assert!(!message.truncated());
        assert_eq!(1, message.answers().len());
        udp_handle.await??;
        tcp_handle.await??;
        Ok(())
    }

    #[test]
    fn test_request_carries_edns() -> Result<()> {
        let mut req = request("example.com.")?;
        req.dnssec = true;
        let (message, _name) = make_request(&req);
        let edns = message.extensions().as_ref().expect("edns should be attached");
        assert_eq!(1232, edns.max_payload());
        assert!(edns.dnssec_ok());
        assert!(!message.recursion_desired());
        Ok(())
    }

    #[test]
    fn test_randomize_case_preserves_name() -> Result<()> {
        let name = Name::from_str("www.example.com.")?;
        let randomized = randomize_case(&name);
        // equality in hickory is case-insensitive
        assert_eq!(name, randomized);
        assert_eq!(name.num_labels(), randomized.num_labels());
        Ok(())
    }

    #[test]
    fn test_matches_request_rejects_wrong_id() -> Result<()> {
        let req = request("example.com.")?;
        let (message, sent_name) = make_request(&req);
        let mut response = make_response(message.clone());
        assert!(matches_request(&response, message.id(), &sent_name, false));
        response.set_id(message.id().wrapping_add(1));
        assert!(!matches_request(&response, message.id(), &sent_name, false));
        Ok(())
    }

    #[test]
    fn test_matches_request_strict_case() -> Result<()> {
        let sent = Name::from_str("wWw.ExAmple.COM.")?;
        let mut response = Message::new();
        response.set_id(9);
        let mut query = hickory_proto::op::Query::new();
        query.set_name(Name::from_str("www.example.com.")?);
        response.add_query(query);
        assert!(matches_request(&response, 9, &sent, false));
        assert!(!matches_request(&response, 9, &sent, true));
        Ok(())
    }
}
