fn main() {
    if let Err(e) = lanekeeper::run() {
        eprintln!("lanekeeper: {}", e);
        std::process::exit(1);
    }
}
