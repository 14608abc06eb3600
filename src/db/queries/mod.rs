pub mod markets;
pub mod orderbooks;
pub mod prices;
pub mod resolutions;
pub mod trades;
