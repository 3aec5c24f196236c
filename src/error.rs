use std::sync::RwLock;

use crate::frame::FrameErr;
use crate::http_upgrade::UpgradeErr;
use crate::tls::TlsErr;
use crate::url::UrlError;

#[derive(thiserror::Error, Debug)]
pub enum WsError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("handshake failed: {0}")]
    Upgrade(#[from] UpgradeErr),
    #[error("protocol violation: {0}")]
    Frame(#[from] FrameErr),
    #[error(transparent)]
    Tls(#[from] TlsErr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ErrorSink = fn(&WsError);

static SINK: RwLock<Option<ErrorSink>> = RwLock::new(None);

/// Replaces the process-wide hook that receives errors swallowed by the
/// drive operations of [`crate::WebSocket`]. `None` restores the default,
/// which logs at error level.
pub fn set_error_sink(sink: Option<ErrorSink>) {
    let mut slot = SINK.write().unwrap_or_else(|e| e.into_inner());
    *slot = sink;
}

pub(crate) fn report(err: &WsError) {
    let sink = *SINK.read().unwrap_or_else(|e| e.into_inner());
    match sink {
        Some(sink) => sink(err),
        None => log::error!("websocket connection failed: {err}"),
    }
}
