pub mod binance;
pub mod kucoin;
