//! Conflux: typed ports, composable arbiters, and a fixed-pool dispatcher.
//!
//! # Overview
//!
//! Conflux is a message-coordination runtime: work is expressed as
//! handlers attached to typed mailboxes ([`Port`]s), and coordination
//! patterns — first-wins choices, all-or-nothing joins, reader-writer
//! interleaves, counted gathers — are expressed as arbiters composed over
//! those attachments. Handlers run as tasks on named [`DispatcherQueue`]s
//! driven by a fixed pool of [`Dispatcher`] worker threads.
//!
//! # Core guarantees
//!
//! - **No lost messages**: a post either reaches a willing receiver or
//!   stays in its port; arbiter vetoes and teardowns put messages back.
//! - **Atomic commitment**: a choice resolves exactly once; a join takes
//!   a complete set or nothing; an interleave never overlaps an exclusive
//!   handler with anything else.
//! - **Fault containment**: a panicking handler never takes down a worker;
//!   faults are routed through [`causality`] contexts, then queue and
//!   dispatcher fault ports.
//! - **Fair staging**: handlers can return continuation sequences that are
//!   advanced one step per scheduling quantum.
//!
//! # Module structure
//!
//! - [`port`]: typed mailboxes and the delivery protocol
//! - [`receiver`]: handler attachments with predicates
//! - [`arbiter`]: choice, join, interleave, gather
//! - [`task`]: schedulable work and continuation sequences
//! - [`queue`]: named task queues, admission policies, timers
//! - [`dispatcher`]: the worker pool
//! - [`causality`]: exception-routing contexts that travel with messages
//! - [`outcome`]: success/failure reporting conventions
//! - [`error`]: the error surface
//!
//! # Example
//!
//! ```
//! use conflux::{Dispatcher, DispatcherQueue, Port};
//!
//! let dispatcher = Dispatcher::new(2, "example");
//! let queue = DispatcherQueue::new("main", &dispatcher).unwrap();
//! let port: Port<u32> = Port::new();
//!
//! conflux::arbiter::activate(
//!     &queue,
//!     [conflux::arbiter::receive(true, &port, |n| {
//!         println!("got {n}");
//!     })],
//! )
//! .unwrap();
//!
//! port.post(42);
//! # std::thread::sleep(std::time::Duration::from_millis(50));
//! dispatcher.dispose();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod arbiter;
pub mod causality;
pub mod dispatcher;
pub mod error;
pub mod outcome;
pub mod port;
pub mod queue;
pub mod receiver;
pub mod task;

pub use arbiter::choice::Choice;
pub use arbiter::gather::{gather1, gather2, gather3, Gather};
pub use arbiter::interleave::{ConcurrentGroup, ExclusiveGroup, Interleave, TeardownGroup};
pub use arbiter::join::{joined_receive, multiple_item_receive, multiple_port_receive};
pub use arbiter::{activate, receive, receive_filtered, receive_staged, ArbiterState, Branch};
pub use causality::Causality;
pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use error::{ArbiterError, Fault, QueueError};
pub use outcome::{execute_to_completion, Complete, SuccessFailurePort};
pub use port::{Port, PortMode};
pub use queue::{DispatcherQueue, PolicyNotification, TaskExecutionPolicy};
pub use receiver::{Receiver, ReceiverState};
pub use task::{Task, TaskSequence};
