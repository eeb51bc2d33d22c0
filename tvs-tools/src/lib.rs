pub mod nom;
