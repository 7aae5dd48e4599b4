mod e2e;
mod utils;
