use std::{
    any::Any,
    error::Error,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

/// Something that can be carried inside a [`Message`] as informational payload.
pub trait Info: fmt::Debug + fmt::Display + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A plain string wrapped as [`Info`], for ad-hoc diagnostics.
#[derive(Debug)]
pub struct StringInfo {
    message: String,
}

impl StringInfo {
    pub fn new(message: String) -> Self {
        StringInfo { message }
    }
}

impl Info for StringInfo {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for StringInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A message flowing over the engine's event bus: either an error or an info payload.
pub trait Message: fmt::Display + Send + Sync {
    fn err(&self) -> Option<&(dyn Error + Send + Sync)>;
    fn info(&self) -> Option<&(dyn Info + Send + Sync)>;
    fn as_any(&self) -> &dyn Any;
}

pub struct InfoMessage {
    info: Arc<dyn Info + Send + Sync>,
}

impl InfoMessage {
    pub fn new(info: Arc<dyn Info + Send + Sync>) -> Self {
        InfoMessage { info }
    }
}

impl Message for InfoMessage {
    fn err(&self) -> Option<&(dyn Error + Send + Sync)> {
        None
    }

    fn info(&self) -> Option<&(dyn Info + Send + Sync)> {
        Some(&*self.info)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for InfoMessage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "Info : {}", self.info)
    }
}

pub struct WarnMessage {
    warning: Arc<dyn Info + Send + Sync>,
}

impl WarnMessage {
    pub fn new(warning: Arc<dyn Info + Send + Sync>) -> Self {
        WarnMessage { warning }
    }
}

impl Message for WarnMessage {
    fn err(&self) -> Option<&(dyn Error + Send + Sync)> {
        None
    }

    fn info(&self) -> Option<&(dyn Info + Send + Sync)> {
        Some(&*self.warning)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for WarnMessage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "Warning : {}", self.warning)
    }
}

#[derive(Debug, Clone)]
pub struct StringError {
    message: String,
}

impl StringError {
    pub fn new(message: String) -> Self {
        StringError { message }
    }
}

impl Error for StringError {}

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub struct ErrorMessage {
    error: Arc<dyn Error + Send + Sync>,
}

impl ErrorMessage {
    pub fn new(error: Arc<dyn Error + Send + Sync>) -> Self {
        ErrorMessage { error }
    }
}

impl Message for ErrorMessage {
    fn err(&self) -> Option<&(dyn Error + Send + Sync)> {
        Some(&*self.error)
    }

    fn info(&self) -> Option<&(dyn Info + Send + Sync)> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for ErrorMessage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "Error : {}", self.error)
    }
}

/// Sends a formatted string as an [`InfoMessage`].
#[macro_export]
macro_rules! send_info {
    ($sender:expr, $($arg:tt)*) => {{
        use std::sync::Arc;
        use $crate::shared::message::{InfoMessage, StringInfo};
        let info = Arc::new(StringInfo::new(format!($($arg)*)));
        let msg: Arc<dyn $crate::shared::message::Message> = Arc::new(InfoMessage::new(info));
        let _ = $sender.send(msg);
    }};
}

/// Sends a formatted string as a [`WarnMessage`].
#[macro_export]
macro_rules! send_warn {
    ($sender:expr, $($arg:tt)*) => {{
        use std::sync::Arc;
        use $crate::shared::message::{WarnMessage, StringInfo};
        let info = Arc::new(StringInfo::new(format!($($arg)*)));
        let msg: Arc<dyn $crate::shared::message::Message> = Arc::new(WarnMessage::new(info));
        let _ = $sender.send(msg);
    }};
}

/// Sends a boxed error as an [`ErrorMessage`].
#[macro_export]
macro_rules! send_error {
    ($sender:expr, $err:expr) => {{
        use std::sync::Arc;
        use $crate::shared::message::ErrorMessage;
        let msg: Arc<dyn $crate::shared::message::Message> =
            Arc::new(ErrorMessage::new(Arc::new($err)));
        let _ = $sender.send(msg);
    }};
}

/// Sends an already-boxed `Arc<dyn Error + Send + Sync>` as an [`ErrorMessage`].
#[macro_export]
macro_rules! send_error_arc {
    ($sender:expr, $err:expr) => {{
        use std::sync::Arc;
        use $crate::shared::message::ErrorMessage;
        let msg: Arc<dyn $crate::shared::message::Message> = Arc::new(ErrorMessage::new($err));
        let _ = $sender.send(msg);
    }};
}
