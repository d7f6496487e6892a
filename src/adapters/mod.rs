// Concrete `ProviderAdapter` implementations (§4.5). One module per
// upstream backend; today that's just Kiro/CodeWhisperer, but new
// backends register under a new credential `provider_type` and adapter
// key without touching the relay orchestrator.

pub mod kiro;

pub use kiro::KiroAdapter;
