fn main() {
    std::process::exit(wssh_bridge::run());
}
