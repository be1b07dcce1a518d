pub mod event;
pub mod field;
pub mod record;
pub mod turn;

pub use event::{AppliedChange, ReconciliationEvent};
pub use field::ExtractedField;
pub use record::{FieldState, PatientRecord};
pub use turn::{ConversationTurn, Role, TurnDraft};
