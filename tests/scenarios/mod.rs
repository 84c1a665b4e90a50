mod cancellation;
mod failure_handling;
mod timers;
