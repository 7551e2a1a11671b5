//! Notification policy and email delivery.

pub mod email;
pub mod throttle;

pub use email::{EmailSender, RecordingEmailSender, SmtpEmailSender};
pub use throttle::{NotificationDecision, evaluate};
