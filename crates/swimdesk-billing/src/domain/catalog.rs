use crate::domain::money::Money;
use crate::domain::types::ProductId;
use serde::{Deserialize, Serialize};

/// Item sold over the counter (goggles, caps, single lessons).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub active: bool,
}

impl Product {
    pub fn new(name: impl Into<String>, price: Money) -> Self {
        Self {
            id: ProductId::new(),
            name: name.into(),
            price,
            active: true,
        }
    }
}
