pub mod support;

mod resilience;
