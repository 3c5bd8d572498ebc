// Domain-layer modules and shared errors/models
pub mod scoring {
    pub use crate::scoring::*;
}

pub mod intake {
    pub use crate::intake::*;
}

pub mod delivery {
    pub use crate::delivery::*;
}

pub mod fulfillment {
    pub use crate::fulfillment::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
