use chatwire_client::FetchError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to set up the REST endpoint on `{stage}`: {source}"))]
    Endpoint {
        stage: &'static str,
        source: FetchError,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("chat controller is no longer running (`{stage}`)"))]
    ControllerStopped { stage: &'static str },
}

pub type AppResult<T> = Result<T, AppError>;
