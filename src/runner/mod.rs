pub mod binance;
pub mod kucoin;

pub use binance::BinanceRunner;
pub use kucoin::KuCoinRunner;
