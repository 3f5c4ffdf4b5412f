//! Type-level guard for the document DAG, built the same way as the
//! teacher's single-process ingestion machine. Here the six stages run as
//! separate worker processes hopping across queues, so no single Rust value
//! can carry a typestate across a queue hop — `ProcessingStage` in the
//! database is the real state. This machine exists to drive the in-process
//! integration-test harness (one process, one document, all six stages)
//! and to give each stage function a compile-checked local transition.
use state_machines::state_machine;

state_machine! {
    name: DocumentMachine,
    state: DocumentState,
    initial: Ready,
    states: [Ready, Crawled, Chunked, Embedded, Evaluated, Extracted, Resolved, Failed],
    events {
        crawl { transition: { from: Ready, to: Crawled } }
        chunk { transition: { from: Crawled, to: Chunked } }
        embed { transition: { from: Chunked, to: Embedded } }
        evaluate { transition: { from: Embedded, to: Evaluated } }
        extract { transition: { from: Evaluated, to: Extracted } }
        resolve { transition: { from: Extracted, to: Resolved } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Crawled, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Embedded, to: Failed }
            transition: { from: Evaluated, to: Failed }
            transition: { from: Extracted, to: Failed }
        }
    }
}

pub fn ready() -> DocumentMachine<(), Ready> {
    DocumentMachine::new(())
}
