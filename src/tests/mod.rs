//! Cross-module tests: whole guest flows on the mock CPU and VM instances on
//! a scripted backend.

mod general_registers;
