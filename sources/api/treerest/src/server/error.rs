use snafu::Snafu;
use std::io;

/// Failures starting or running the server.  Failures of individual requests never get this
/// far; the dispatcher turns them into responses.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display("Unable to bind to {}: {}", addr, source))]
    BindSocket { addr: String, source: io::Error },

    #[snafu(display("Unable to start server: {}", source))]
    ServerStart { source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
