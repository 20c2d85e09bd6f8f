use thiserror::Error;

/// Crate-wide result alias. Replaces the teacher's `Result<T, &'static str>` with a
/// proper error enum now that this engine is meant to stand on its own outside a
/// host that already funnels string errors into a single console.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open JACK client {client}: {source}")]
    JackClient {
        client: &'static str,
        #[source]
        source: jack::Error,
    },
    #[error("failed to register JACK port {port} on client {client}: {source}")]
    JackPort {
        client: &'static str,
        port: String,
        #[source]
        source: jack::Error,
    },
    #[error("failed to connect JACK ports {from} -> {to}: {source}")]
    JackConnect {
        from: String,
        to: String,
        #[source]
        source: jack::Error,
    },
    #[error("command pool exhausted, dropping event")]
    PoolExhausted,
    #[error("no voice available to start clip playback")]
    NoFreeVoice,
    #[error("clip {0} is not registered with the sampler")]
    ClipNotRegistered(crate::clip::ClipId),
    #[error("failed to decode audio file {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("WAV encode error: {0}")]
    Wav(#[from] hound::Error),
}
