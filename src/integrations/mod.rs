//! External service integrations.

pub mod crm_client {
    pub use crate::crm_client::*;
}

pub mod mailer {
    pub use crate::mailer::*;
}

pub mod services {
    pub use crate::services::*;
}

pub mod webhook_models {
    pub use crate::webhook_models::*;
}
