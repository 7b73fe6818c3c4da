// Onion routing: layered requests through a path of snodes

pub mod builder;
pub mod destination;
pub mod encoding;
pub mod error;
pub mod path;
pub mod transport;

pub use destination::OnionDestination;
pub use error::{ErrorStatus, FailureDecision, OnionError};
pub use path::{Path, PathError, PathManager};
pub use transport::{
    HttpClient, HttpError, HttpOnionTransport, HttpResponse, OnionResponse, OnionTransport,
    ReqwestHttpClient,
};
