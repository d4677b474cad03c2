fn main() {
    if let Err(err) = companion::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
