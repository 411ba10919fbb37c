fn main() {
    std::process::exit(mantra::cli::run());
}
