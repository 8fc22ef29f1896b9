fn main() -> Result<(), String> {
    resonance_meter_lib::run()
}
