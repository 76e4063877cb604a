mod scheduler;
mod support;
