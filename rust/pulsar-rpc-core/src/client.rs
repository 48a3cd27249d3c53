//! Typed client helpers, the shapes generated stubs expose.

use futures_util::future::BoxFuture;
use pulsar_rpc_wire::{Metadata, Status};
use tokio::sync::mpsc;

use crate::{Call, CallListener, CallOptions, Channel, MethodDescriptor};

enum Reply<Resp> {
    Headers(Metadata),
    Message(Resp),
    Close(Status, Metadata),
}

/// Listener forwarding every event into an unbounded queue.
struct QueueListener<Resp> {
    tx: mpsc::UnboundedSender<Reply<Resp>>,
}

impl<Resp: Send + 'static> CallListener<Resp> for QueueListener<Resp> {
    fn on_headers(&mut self, headers: Metadata) {
        let _ = self.tx.send(Reply::Headers(headers));
    }

    fn on_message(&mut self, message: Resp) {
        let _ = self.tx.send(Reply::Message(message));
    }

    fn on_close(&mut self, status: Status, trailers: Metadata) {
        let _ = self.tx.send(Reply::Close(status, trailers));
    }
}

/// Response messages of a call, ending with its status.
pub struct ResponseStream<Resp> {
    rx: mpsc::UnboundedReceiver<Reply<Resp>>,
    headers: Option<Metadata>,
    trailers: Option<Metadata>,
    status: Option<Status>,
}

impl<Resp> ResponseStream<Resp> {
    fn new(rx: mpsc::UnboundedReceiver<Reply<Resp>>) -> Self {
        Self {
            rx,
            headers: None,
            trailers: None,
            status: None,
        }
    }

    /// Next response message. `Ok(None)` once the call ended with `OK`; the
    /// terminal status as `Err` otherwise.
    pub async fn message(&mut self) -> Result<Option<Resp>, Status> {
        if let Some(status) = &self.status {
            return finished(status);
        }
        loop {
            match self.rx.recv().await {
                Some(Reply::Headers(headers)) => self.headers = Some(headers),
                Some(Reply::Message(message)) => return Ok(Some(message)),
                Some(Reply::Close(status, trailers)) => {
                    self.trailers = Some(trailers);
                    let result = finished(&status);
                    self.status = Some(status);
                    return result;
                }
                None => {
                    let status = Status::internal("call ended without a status");
                    self.status = Some(status.clone());
                    return Err(status);
                }
            }
        }
    }

    /// Response headers, once received.
    pub fn headers(&self) -> Option<&Metadata> {
        self.headers.as_ref()
    }

    /// Trailers carried with the terminal status, once received.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.trailers.as_ref()
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }
}

fn finished<T>(status: &Status) -> Result<Option<T>, Status> {
    if status.is_ok() {
        Ok(None)
    } else {
        Err(status.clone())
    }
}

/// Exactly one message followed by `OK`.
async fn single_response<Resp>(responses: &mut ResponseStream<Resp>) -> Result<Resp, Status> {
    let message = responses
        .message()
        .await?
        .ok_or_else(|| Status::internal("no response message received"))?;
    match responses.message().await? {
        None => Ok(message),
        Some(_) => Err(Status::internal("more than one response message received")),
    }
}

/// Future resolving to the single response of a client-streaming call.
pub type ResponseFuture<Resp> = BoxFuture<'static, Result<Resp, Status>>;

/// Request side of a streaming call.
pub struct RequestSink<Req, Resp> {
    call: Call<Req, Resp>,
}

impl<Req, Resp> RequestSink<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub async fn send(&self, message: &Req) -> Result<(), Status> {
        self.call.send_message(message).await.map_err(|e| e.to_status())
    }

    /// No more requests follow.
    pub async fn close(&self) -> Result<(), Status> {
        self.call.half_close().await.map_err(|e| e.to_status())
    }

    pub async fn cancel(&self, reason: impl Into<String>) {
        self.call.cancel(reason).await
    }

    pub fn call(&self) -> &Call<Req, Resp> {
        &self.call
    }
}

async fn open<Req, Resp>(
    channel: &Channel,
    descriptor: &MethodDescriptor<Req, Resp>,
    options: CallOptions,
) -> Result<(Call<Req, Resp>, ResponseStream<Resp>), Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let metadata = options.metadata().clone();
    let call = channel.new_call(descriptor, options);
    let (tx, rx) = mpsc::unbounded_channel();
    call.start(QueueListener { tx }, metadata)
        .await
        .map_err(|e| e.to_status())?;
    Ok((call, ResponseStream::new(rx)))
}

/// One request, one response.
pub async fn unary<Req, Resp>(
    channel: &Channel,
    descriptor: &MethodDescriptor<Req, Resp>,
    request: &Req,
    options: CallOptions,
) -> Result<Resp, Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (call, mut responses) = open(channel, descriptor, options).await?;
    call.send_message(request).await.map_err(|e| e.to_status())?;
    call.half_close().await.map_err(|e| e.to_status())?;
    single_response(&mut responses).await
}

/// One request, a stream of responses.
pub async fn server_streaming<Req, Resp>(
    channel: &Channel,
    descriptor: &MethodDescriptor<Req, Resp>,
    request: &Req,
    options: CallOptions,
) -> Result<ResponseStream<Resp>, Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (call, responses) = open(channel, descriptor, options).await?;
    call.send_message(request).await.map_err(|e| e.to_status())?;
    call.half_close().await.map_err(|e| e.to_status())?;
    Ok(responses)
}

/// A stream of requests, one response.
pub async fn client_streaming<Req, Resp>(
    channel: &Channel,
    descriptor: &MethodDescriptor<Req, Resp>,
    options: CallOptions,
) -> Result<(RequestSink<Req, Resp>, ResponseFuture<Resp>), Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (call, mut responses) = open(channel, descriptor, options).await?;
    let response: ResponseFuture<Resp> =
        Box::pin(async move { single_response(&mut responses).await });
    Ok((RequestSink { call }, response))
}

/// Streams in both directions.
pub async fn bidi_streaming<Req, Resp>(
    channel: &Channel,
    descriptor: &MethodDescriptor<Req, Resp>,
    options: CallOptions,
) -> Result<(RequestSink<Req, Resp>, ResponseStream<Resp>), Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (call, responses) = open(channel, descriptor, options).await?;
    Ok((RequestSink { call }, responses))
}
