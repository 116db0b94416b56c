pub mod activity;
pub mod audience;
pub mod campaigns;
pub mod chat;
pub mod direct;
pub mod dispatcher;
pub mod queue;
pub mod rules;
pub mod schedule;
pub mod tokens;
pub mod worker;
