pub mod ata;
pub mod keyboard;

pub fn init() {
    keyboard::init();
    ata::init();
    crate::log_info!("drivers: subsystem initialized");
}
