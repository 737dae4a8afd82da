use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::driver::Resolver;
use crate::failure::{self, ExtendedErrorCode};
use crate::options::ResolverOptions;
use crate::question::Question;
use crate::transport::MAX_RECEIVE_BUFFER_SIZE;

/// Serves the resolver over UDP, one task per request.
pub async fn daemon(
    resolver: Resolver,
    options: ResolverOptions,
    listen_port: u16,
) -> anyhow::Result<()> {
    let sock =
        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port)).await?;
    let socket = Arc::new(sock);
    let resolver = Arc::new(resolver);
    let options = Arc::new(options);

    let mut buf = [0; MAX_RECEIVE_BUFFER_SIZE];
    loop {
        let (message, peer) = read_message(socket.deref(), &mut buf).await?;
        debug!(%peer, "read message {message}");
        tokio::spawn(handle(socket.clone(), message, peer, resolver.clone(), options.clone()));
    }
}

async fn handle(
    socket: Arc<UdpSocket>,
    message: Message,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
    options: Arc<ResolverOptions>,
) -> anyhow::Result<()> {
    let response = respond(message, &resolver, &options).await;
    socket.send_to(response.to_vec()?.as_slice(), peer).await?;
    Ok(())
}

async fn respond(request: Message, resolver: &Resolver, options: &ResolverOptions) -> Message {
    let Some(query) = request.queries().first() else {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_response_code(hickory_proto::op::ResponseCode::FormErr);
        return response;
    };
    let question = Question::from_query(query);
    let mut response =
        match resolver.resolve(question.clone(), options, &CancelToken::never()).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%question, "resolution failed: {e}");
                failure::synthesize_servfail(
                    &question,
                    ExtendedErrorCode::Other,
                    &e.to_string(),
                    options,
                )
            }
        };
    response.set_id(request.id());
    response.set_recursion_available(true);
    response.set_recursion_desired(request.recursion_desired());
    response
}

async fn read_message(socket: &UdpSocket, buf: &mut [u8]) -> anyhow::Result<(Message, SocketAddr)> {
    let (bytes_read, addr) = socket.recv_from(buf).await?;
    Ok((Message::from_bytes(&buf[..bytes_read])?, addr))
}
