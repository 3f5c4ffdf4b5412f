//! The self-governing half of the system: an auditor that scores the
//! knowledge base, an orchestrator that runs an OODA loop over audit
//! reports and queue depth, a researcher that turns gaps into crawl jobs,
//! a monitor/healer pair that watches the pipeline and repairs it, and a
//! verifier that fact-checks DTCs against an external model.

pub mod auditor;
pub mod healer;
pub mod monitor;
pub mod orchestrator;
pub mod researcher;
pub mod verifier;
