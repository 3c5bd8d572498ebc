// Thin namespace wrapper for API-layer components
pub mod handlers {
    pub use crate::handlers::*;
}

pub mod lead_handler {
    pub use crate::lead_handler::*;
}

pub mod webhook_handler {
    pub use crate::webhook_handler::*;
}

pub mod routes {
    pub use crate::routes::*;
}
