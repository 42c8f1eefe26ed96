pub mod allocation;
pub mod catalog;
pub mod clock;
pub mod coordinator;
pub mod enrolments;
pub mod entitlements;
pub mod families;
pub mod invoices;
pub mod invoicing;
pub mod money;
pub mod payments;
pub mod summary;
pub mod types;

pub use allocation::{
    AllocationEngine, AllocationMode, AllocationPlan, AllocationRequest, EnrolmentPurchase,
    PaymentTarget, PlannedAllocation,
};
pub use catalog::Product;
pub use clock::{Clock, FixedClock, SystemClock};
pub use coordinator::{
    PayAheadRequest, PaymentCoordinator, PaymentOperations, PaymentPreview, PaymentRequest,
};
pub use enrolments::{Enrolment, EnrolmentPlan, UnitTerms};
pub use entitlements::{
    EntitlementChange, EntitlementDelta, EntitlementProjector, ProjectionContext, PurchaseBasis,
};
pub use families::{Family, Student};
pub use invoices::{Invoice, InvoiceLedger, InvoiceLineItem};
pub use invoicing::{CounterSaleItem, CounterSaleReceipt, CounterSaleRequest, InvoiceManager};
pub use money::Money;
pub use payments::{
    Allocation, EntitlementOutcome, Payment, PaymentMetadata, PaymentReceipt, PaymentRecord,
    UndoReceipt,
};
pub use summary::{BillingSummary, BillingSummaryBuilder};
pub use types::{
    AllocationId, BillingType, EnrolmentId, EnrolmentStatus, FamilyId, InvoiceId, InvoiceKind,
    InvoiceStatus, PaymentId, PaymentMethod, PlanId, ProductId, StudentId, TransactionState,
};
