fn main() {
    #[cfg(feature = "iio")]
    {
        println!("cargo:rustc-link-lib=iio");
    }

    #[cfg(feature = "limesuite")]
    {
        println!("cargo:rustc-link-lib=LimeSuite");
    }
}
