mod helpers;

mod failover;
mod selection;
