mod client;
mod stream;
mod transport;
mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ApiClient, SendOptions, MAX_AUTH_RETRIES};
pub use stream::{chat_channel, stream_url, StreamConnection};
pub use transport::{
    FilePart, HttpRequest, HttpResponse, MultipartBody, ReqwestTransport, RequestBody, Transport,
};
pub use upload::{ProgressSender, ProgressTracker, UploadFile, UploadStream, DEFAULT_UPLOAD_FIELD};

pub(crate) use client::extract_message;
