pub mod helpers;
mod tests_needs;
