use std::fmt;

/// Stable error keys surfaced through the view-model so the UI can
/// translate them. Anything outside the taxonomy passes through verbatim
/// as `Raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKey {
    ConnectionTimeout,
    IceFailed,
    WebrtcUnsupported,
    InvalidOffer,
    InvalidOfferFormat,
    InvalidAnswer,
    InvalidAnswerFormat,
    Raw(String),
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKey::ConnectionTimeout => f.write_str("connectionTimeout"),
            ErrorKey::IceFailed => f.write_str("iceFailed"),
            ErrorKey::WebrtcUnsupported => f.write_str("webrtcUnsupported"),
            ErrorKey::InvalidOffer => f.write_str("invalidOffer"),
            ErrorKey::InvalidOfferFormat => f.write_str("invalidOfferFormat"),
            ErrorKey::InvalidAnswer => f.write_str("invalidAnswer"),
            ErrorKey::InvalidAnswerFormat => f.write_str("invalidAnswerFormat"),
            ErrorKey::Raw(message) => f.write_str(message),
        }
    }
}

/// Map a peer-library failure message onto an error key. ICE failures and
/// unsupported environments get stable keys; everything else is passed
/// through for the UI to display raw.
pub(crate) fn classify_peer_error(message: &str) -> ErrorKey {
    if message.contains("Ice connection") || message.contains("ICE") {
        ErrorKey::IceFailed
    } else if message.contains("not supported") || message.contains("unsupported") {
        ErrorKey::WebrtcUnsupported
    } else {
        ErrorKey::Raw(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_for_i18n() {
        assert_eq!(ErrorKey::ConnectionTimeout.to_string(), "connectionTimeout");
        assert_eq!(ErrorKey::IceFailed.to_string(), "iceFailed");
        assert_eq!(ErrorKey::WebrtcUnsupported.to_string(), "webrtcUnsupported");
        assert_eq!(ErrorKey::InvalidOffer.to_string(), "invalidOffer");
        assert_eq!(ErrorKey::InvalidOfferFormat.to_string(), "invalidOfferFormat");
        assert_eq!(ErrorKey::InvalidAnswer.to_string(), "invalidAnswer");
        assert_eq!(ErrorKey::InvalidAnswerFormat.to_string(), "invalidAnswerFormat");
    }

    #[test]
    fn raw_messages_pass_through() {
        assert_eq!(
            ErrorKey::Raw("something odd".to_string()).to_string(),
            "something odd"
        );
    }

    #[test]
    fn ice_failures_are_classified() {
        assert_eq!(
            classify_peer_error("Ice connection failed: no candidates"),
            ErrorKey::IceFailed
        );
        assert_eq!(
            classify_peer_error("ICE agent gave up"),
            ErrorKey::IceFailed
        );
    }

    #[test]
    fn unsupported_environment_is_classified() {
        assert_eq!(
            classify_peer_error("data channels are not supported here"),
            ErrorKey::WebrtcUnsupported
        );
    }

    #[test]
    fn unknown_errors_stay_raw() {
        assert_eq!(
            classify_peer_error("mysterious failure"),
            ErrorKey::Raw("mysterious failure".to_string())
        );
    }
}
