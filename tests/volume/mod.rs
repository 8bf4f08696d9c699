//! Attach and detach scenarios driven through the operation dispatcher.

mod bdd_steps;
mod scenarios;
mod test_helpers;
