fn main() -> std::io::Result<()> {
    docbase_server::main()
}
