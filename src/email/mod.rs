//! Email handling: parsing inbound mail, composing replies, and handing them
//! to a transport.

pub mod charset;
pub mod compose;
pub mod html;
pub mod parser;
pub mod transport;
pub mod types;

pub use compose::{OutboundMessage, QuotePolicy, ReplyComposer, ReplyDraft};
pub use parser::{ParserOptions, parse, parse_with};
pub use transport::{MailTransport, TransportConfig, create_transport};
pub use types::{EmailAddress, InboundMessage};
