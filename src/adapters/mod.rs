pub mod amqp;
pub mod postgres;

pub use amqp::AmqpTransport;
pub use postgres::PgStore;
