fn main() {
    pipebox::cli::run()
}
